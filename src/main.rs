use anyhow::{bail, Context, Result};
use chunk_uploader::{
    config::LogConfig, logging, AppConfig, LocalDirTransport, SnapshotRecord, UploadEvent,
    UploadFile, UploadOrchestrator,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "chunk-uploader")]
#[command(version, about = "分片上传文件到目标目录，支持断点续传", long_about = None)]
struct CliArgs {
    /// 配置文件路径
    #[arg(short, long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config_path: String,

    /// 目标目录
    #[arg(short, long)]
    target: PathBuf,

    /// 要上传的文件或目录
    #[arg(required = true, num_args = 1..)]
    inputs: Vec<PathBuf>,
}

/// 加载日志配置
///
/// 只读取配置文件中的 [log] 段，失败时返回默认配置
async fn load_log_config(path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

/// 展开输入路径：目录递归遍历，跳过隐藏文件
fn expand_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            files.push(input.clone());
            continue;
        }
        if !input.is_dir() {
            warn!("路径不存在或不是普通文件，已跳过: {:?}", input);
            continue;
        }

        for entry in WalkDir::new(input)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()))
        {
            match entry {
                Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
                Ok(_) => {}
                Err(e) => warn!("遍历目录出错，已跳过: {}", e),
            }
        }
    }
    files
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// 上次中断的同名同大小文件沿用快照中的文件ID
fn attach_recovered_id(file: UploadFile, recoverable: &[SnapshotRecord]) -> UploadFile {
    match recoverable
        .iter()
        .find(|r| r.file_name == file.name && r.file_size == file.size)
    {
        Some(record) => {
            info!(
                "发现未完成的上传: {} (已上传 {}%)",
                record.file_name, record.progress
            );
            file.with_id(record.file_id.clone())
        }
        None => file,
    }
}

fn log_event(event: &UploadEvent) {
    match event {
        UploadEvent::FileProgress {
            file_id,
            progress,
            completed_chunks,
            total_chunks,
            ..
        } => debug!(
            "进度: {} {}% ({}/{})",
            file_id, progress, completed_chunks, total_chunks
        ),
        UploadEvent::FileRejected { error } => warn!("文件被拒绝: {}", error),
        UploadEvent::FileError { name, error, .. } => error!("上传失败: {} - {}", name, error),
        UploadEvent::FileComplete { name, size, .. } => info!("✓ {} ({} bytes)", name, size),
        UploadEvent::PerformanceUpdate { performance } => debug!(
            "速度: {} B/s, 平均 {} B/s, 剩余 {} bytes",
            performance.current_speed, performance.average_speed, performance.remaining_bytes
        ),
        other => debug!("事件: {}", other.event_type_name()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let log_config = load_log_config(&args.config_path).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("Chunk Uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&args.config_path).await;
    tokio::fs::create_dir_all(&args.target)
        .await
        .with_context(|| format!("创建目标目录失败: {:?}", args.target))?;

    let transport = Arc::new(LocalDirTransport::new(&args.target));
    let orchestrator = UploadOrchestrator::new(config, transport)?;
    let recoverable = orchestrator.recoverable().await?;

    let paths = expand_inputs(&args.inputs);
    if paths.is_empty() {
        bail!("没有找到可上传的文件");
    }

    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        match UploadFile::from_path(path).await {
            Ok(file) => files.push(attach_recovered_id(file, &recoverable)),
            Err(e) => warn!("无法读取文件，已跳过: {:#}", e),
        }
    }
    info!("共 {} 个文件，目标目录: {:?}", files.len(), args.target);

    let mut events = orchestrator.subscribe();
    let added = orchestrator.add_files(files).await?;
    if added.accepted.is_empty() {
        orchestrator.destroy().await?;
        bail!("所有文件都未通过校验");
    }

    let stats = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(UploadEvent::AllComplete { stats }) => break stats,
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("事件处理过慢，丢失 {} 个事件", skipped),
                Err(RecvError::Closed) => bail!("上传编排器意外退出"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("收到 Ctrl+C，保存上传进度后退出...");
                orchestrator.destroy().await?;
                return Ok(());
            }
        }
    };

    let performance = orchestrator.performance().await?;
    orchestrator.destroy().await?;

    info!(
        "上传结束: 完成 {}, 失败 {}, 共上传 {} bytes, 平均速度 {} B/s",
        stats.completed, stats.failed, performance.total_uploaded, performance.average_speed
    );
    if stats.failed > 0 {
        bail!("{} 个文件上传失败", stats.failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let parsed =
            CliArgs::try_parse_from(["chunk-uploader", "--target", "out", "a.txt", "dir"]).unwrap();
        assert_eq!(parsed.config_path, DEFAULT_CONFIG_PATH);
        assert_eq!(parsed.target, PathBuf::from("out"));
        assert_eq!(
            parsed.inputs,
            vec![PathBuf::from("a.txt"), PathBuf::from("dir")]
        );

        let parsed =
            CliArgs::try_parse_from(["chunk-uploader", "-c", "my.toml", "-t", "out", "a.txt"])
                .unwrap();
        assert_eq!(parsed.config_path, "my.toml");

        // 缺少目标目录、缺少输入、参数缺值
        assert!(CliArgs::try_parse_from(["chunk-uploader", "a.txt"]).is_err());
        assert!(CliArgs::try_parse_from(["chunk-uploader", "--target", "out"]).is_err());
        assert!(CliArgs::try_parse_from(["chunk-uploader", "--target"]).is_err());
    }

    #[test]
    fn test_expand_inputs_skips_hidden_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::create_dir_all(dir.path().join(".parts")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"h").unwrap();
        std::fs::write(dir.path().join(".parts/part-00001"), b"p").unwrap();

        let mut files = expand_inputs(&[dir.path().to_path_buf()]);
        files.sort();
        assert_eq!(
            files,
            vec![dir.path().join("a.txt"), dir.path().join("sub/b.txt")]
        );
    }
}
