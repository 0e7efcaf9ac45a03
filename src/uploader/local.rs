// 本地目录传输层
//
// 把目标目录当作“服务器”：分片写入 <root>/.parts/<upload_id>/part-NNNNN，
// finalize 时按编号顺序拼接成 <root>/<文件名> 并删除分片目录。
// 上传ID由文件名和大小确定，同一文件重新上传时可以找回已写入的分片。

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::uploader::chunk::{CommittedPart, ExistingPart};
use crate::uploader::transport::{
    BeginResponse, ChunkPayload, FileDescriptor, FinalizeResponse, UploadPartResponse,
    UploadTransport,
};

const PARTS_DIR: &str = ".parts";
const PART_PREFIX: &str = "part-";

/// 本地目录传输层
#[derive(Debug, Clone)]
pub struct LocalDirTransport {
    root: PathBuf,
}

impl LocalDirTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 由文件名和大小生成上传ID
    pub fn upload_id_for(name: &str, size: u64) -> String {
        let sanitized: String = target_name(name)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}-{}", sanitized, size)
    }

    /// 合并后的目标文件路径
    pub fn target_path(&self, name: &str) -> PathBuf {
        self.root.join(target_name(name))
    }

    fn parts_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(PARTS_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.parts_dir(upload_id)
            .join(format!("{}{:05}", PART_PREFIX, part_number))
    }

    fn upload_id(file: &FileDescriptor) -> String {
        file.upload_id
            .clone()
            .unwrap_or_else(|| Self::upload_id_for(&file.name, file.size))
    }
}

/// 只保留文件名部分，防止路径穿越
fn target_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unnamed".to_string())
}

fn part_etag(part_number: u32, len: u64) -> String {
    format!("{}-{}", part_number, len)
}

fn parse_part_number(file_name: &str) -> Option<u32> {
    file_name.strip_prefix(PART_PREFIX)?.parse().ok()
}

#[async_trait]
impl UploadTransport for LocalDirTransport {
    async fn begin(&self, file: &FileDescriptor) -> Result<BeginResponse> {
        let target = self.target_path(&file.name);
        if let Ok(metadata) = fs::metadata(&target).await {
            if metadata.is_file() && metadata.len() == file.size {
                info!("目标文件已存在且大小一致，跳过上传: {:?}", target);
                return Ok(BeginResponse {
                    skip_upload: true,
                    upload_id: None,
                });
            }
        }

        let upload_id = Self::upload_id_for(&file.name, file.size);
        let dir = self.parts_dir(&upload_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("创建分片目录失败: {:?}", dir))?;

        debug!("开始上传: file={}, upload_id={}", file.name, upload_id);
        Ok(BeginResponse {
            skip_upload: false,
            upload_id: Some(upload_id),
        })
    }

    async fn list_existing_parts(&self, file: &FileDescriptor) -> Result<Option<Vec<ExistingPart>>> {
        let dir = self.parts_dir(&Self::upload_id(file));
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Some(Vec::new())),
            Err(e) => {
                return Err(e).with_context(|| format!("读取分片目录失败: {:?}", dir));
            }
        };

        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(part_number) = parse_part_number(&name) else {
                continue;
            };
            let len = entry.metadata().await?.len();
            parts.push(ExistingPart::new(
                part_number,
                part_etag(part_number, len),
                Some(len),
            ));
        }
        parts.sort_by_key(|p| p.part_number);

        debug!("已存在分片: file={}, 数量={}", file.name, parts.len());
        Ok(Some(parts))
    }

    async fn upload_part(&self, file: &FileDescriptor, chunk: ChunkPayload) -> Result<UploadPartResponse> {
        let upload_id = Self::upload_id(file);
        let path = self.part_path(&upload_id, chunk.part_number);
        let tmp_path = path.with_extension("tmp");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建分片目录失败: {:?}", parent))?;
        }
        fs::write(&tmp_path, &chunk.data)
            .await
            .with_context(|| format!("写入分片失败: {:?}", tmp_path))?;
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("提交分片失败: {:?}", path))?;

        Ok(UploadPartResponse {
            etag: part_etag(chunk.part_number, chunk.data.len() as u64),
        })
    }

    async fn finalize(&self, file: &FileDescriptor, parts: &[CommittedPart]) -> Result<FinalizeResponse> {
        let upload_id = Self::upload_id(file);
        let target = self.target_path(&file.name);
        let tmp_target = self.root.join(format!(".{}.merging", target_name(&file.name)));

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("创建目标目录失败: {:?}", self.root))?;

        let mut output = fs::File::create(&tmp_target)
            .await
            .with_context(|| format!("创建目标文件失败: {:?}", tmp_target))?;
        let mut written = 0u64;
        for part in parts {
            let path = self.part_path(&upload_id, part.part_number);
            let data = fs::read(&path)
                .await
                .with_context(|| format!("读取分片 #{} 失败: {:?}", part.part_number, path))?;
            if data.len() as u64 != part.size {
                anyhow::bail!(
                    "分片 #{} 大小不一致: 期望 {} bytes, 实际 {} bytes",
                    part.part_number,
                    part.size,
                    data.len()
                );
            }
            output.write_all(&data).await?;
            written += data.len() as u64;
        }
        output.flush().await?;
        drop(output);

        if written != file.size {
            let _ = fs::remove_file(&tmp_target).await;
            anyhow::bail!("合并后大小不一致: 期望 {} bytes, 实际 {} bytes", file.size, written);
        }

        fs::rename(&tmp_target, &target)
            .await
            .with_context(|| format!("重命名目标文件失败: {:?}", target))?;

        let parts_dir = self.parts_dir(&upload_id);
        if let Err(e) = fs::remove_dir_all(&parts_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("清理分片目录失败: {:?}, 错误: {}", parts_dir, e);
            }
        }

        info!("✓ 合并完成: {:?} ({} bytes, {} 个分片)", target, written, parts.len());
        let mut extra = HashMap::new();
        extra.insert("path".to_string(), target.to_string_lossy().to_string());
        Ok(FinalizeResponse {
            url: Some(format!("file://{}", target.display())),
            extra,
        })
    }

    async fn notify_pause(&self, file: &FileDescriptor) -> Result<()> {
        debug!("上传暂停，已写入的分片保留: file={}", file.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::events::UploadEvent;
    use crate::uploader::orchestrator::UploadOrchestrator;
    use crate::uploader::queue::UploadFile;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn descriptor(name: &str, size: u64) -> FileDescriptor {
        FileDescriptor {
            id: "f1".to_string(),
            name: name.to_string(),
            size,
            mime_type: None,
            upload_id: Some(LocalDirTransport::upload_id_for(name, size)),
            total_chunks: 0,
        }
    }

    fn payload(part_number: u32, start: u64, data: &[u8]) -> ChunkPayload {
        ChunkPayload {
            part_number,
            start,
            end: start + data.len() as u64,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_upload_id_and_target_name() {
        assert_eq!(LocalDirTransport::upload_id_for("a b.txt", 10), "a_b.txt-10");
        let transport = LocalDirTransport::new("/tmp/root");
        assert_eq!(
            transport.target_path("../../etc/passwd"),
            PathBuf::from("/tmp/root/passwd")
        );
        assert_eq!(parse_part_number("part-00012"), Some(12));
        assert_eq!(parse_part_number("part-00012.tmp"), None);
    }

    #[tokio::test]
    async fn test_parts_are_listed_and_merged_in_order() {
        let dir = TempDir::new().unwrap();
        let transport = LocalDirTransport::new(dir.path());
        let file = descriptor("hello.txt", 11);

        let begin = transport.begin(&file).await.unwrap();
        assert!(!begin.skip_upload);

        let second = transport
            .upload_part(&file, payload(2, 6, b"world"))
            .await
            .unwrap();
        let first = transport
            .upload_part(&file, payload(1, 0, b"hello "))
            .await
            .unwrap();
        assert_eq!(first.etag, "1-6");

        let existing = transport.list_existing_parts(&file).await.unwrap().unwrap();
        assert_eq!(existing.len(), 2);
        assert_eq!(existing[0].part_number, 1);
        assert_eq!(existing[1].size, Some(5));

        let parts = vec![
            CommittedPart {
                part_number: 1,
                etag: first.etag,
                size: 6,
            },
            CommittedPart {
                part_number: 2,
                etag: second.etag,
                size: 5,
            },
        ];
        let response = transport.finalize(&file, &parts).await.unwrap();
        assert!(response.url.unwrap().starts_with("file://"));

        let merged = std::fs::read(dir.path().join("hello.txt")).unwrap();
        assert_eq!(merged, b"hello world");
        assert!(!dir
            .path()
            .join(PARTS_DIR)
            .join(file.upload_id.as_deref().unwrap())
            .exists());

        // 目标已存在且大小一致时跳过
        let begin = transport.begin(&file).await.unwrap();
        assert!(begin.skip_upload);
    }

    #[tokio::test]
    async fn test_finalize_rejects_missing_bytes() {
        let dir = TempDir::new().unwrap();
        let transport = LocalDirTransport::new(dir.path());
        let file = descriptor("short.bin", 10);

        transport.begin(&file).await.unwrap();
        transport
            .upload_part(&file, payload(1, 0, b"1234"))
            .await
            .unwrap();
        let parts = vec![CommittedPart {
            part_number: 1,
            etag: "1-4".to_string(),
            size: 4,
        }];
        assert!(transport.finalize(&file, &parts).await.is_err());
        assert!(!dir.path().join("short.bin").exists());
    }

    #[tokio::test]
    async fn test_orchestrated_upload_resumes_from_written_parts() {
        let source_dir = TempDir::new().unwrap();
        let target_dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..50u8).collect();
        let source_path = source_dir.path().join("data.bin");
        std::fs::write(&source_path, &content).unwrap();

        // 预先写入前两个分片，模拟中断的上传
        let transport = LocalDirTransport::new(target_dir.path());
        let file = descriptor("data.bin", 50);
        transport.begin(&file).await.unwrap();
        transport
            .upload_part(&file, payload(1, 0, &content[0..16]))
            .await
            .unwrap();
        transport
            .upload_part(&file, payload(2, 16, &content[16..32]))
            .await
            .unwrap();

        let mut config = AppConfig::default();
        config.upload.chunk_size = 16;
        let orchestrator = UploadOrchestrator::with_store(config, Arc::new(transport), None).unwrap();
        let mut rx = orchestrator.subscribe();

        let upload = UploadFile::from_path(&source_path).await.unwrap();
        orchestrator.add_files(vec![upload]).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(event @ UploadEvent::FileComplete { .. }) => return event,
                    Ok(UploadEvent::FileError { error, .. }) => panic!("upload failed: {}", error),
                    Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event channel error: {}", e),
                }
            }
        })
        .await
        .expect("timed out");
        assert!(matches!(event, UploadEvent::FileComplete { size: 50, .. }));

        let merged = std::fs::read(target_dir.path().join("data.bin")).unwrap();
        assert_eq!(merged, content);
    }
}
