// 上传数据源
//
// 分片上传时按字节范围读取数据，数据源由队列中的文件条目持有

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 按字节范围读取的数据源
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// 读取 [range.start, range.end) 的数据
    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>>;
}

/// 本地文件数据源
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path)
            .await
            .with_context(|| format!("打开上传文件失败: {:?}", self.path))?;

        // 定位到分片起始位置
        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .context("文件定位失败")?;

        let len = (range.end - range.start) as usize;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)
            .await
            .context("读取分片数据失败")?;

        debug!(
            "读取分片数据: {:?}, bytes={}-{}, 大小={} bytes",
            self.path,
            range.start,
            range.end.saturating_sub(1),
            len
        );

        Ok(buffer)
    }
}

/// 内存数据源
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Arc<Vec<u8>>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        let len = self.len();
        if range.start > range.end || range.end > len {
            anyhow::bail!(
                "读取范围越界: {}-{}, 数据长度={}",
                range.start,
                range.end,
                len
            );
        }
        Ok(self.data[range.start as usize..range.end as usize].to_vec())
    }
}
