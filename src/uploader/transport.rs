// 上传传输层接口
//
// 与远端服务器的交互全部通过注入的 UploadTransport 完成，
// 每个能力都有默认实现，调用方只需覆盖自己支持的部分

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::uploader::chunk::{CommittedPart, ExistingPart};

/// 传给回调的文件描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// begin 返回的上传ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    pub total_chunks: u32,
}

/// 分片数据
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub part_number: u32,
    pub start: u64,
    pub end: u64,
    pub data: Vec<u8>,
}

impl ChunkPayload {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// begin 返回
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginResponse {
    /// 服务器已有该文件（去重），跳过分片上传
    #[serde(default)]
    pub skip_upload: bool,
    #[serde(default)]
    pub upload_id: Option<String>,
}

/// upload_part 返回
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPartResponse {
    pub etag: String,
}

/// finalize 返回
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResponse {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// 上传传输层
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// 开始上传（对应初始化 / 预创建）
    async fn begin(&self, _file: &FileDescriptor) -> Result<BeginResponse> {
        Ok(BeginResponse::default())
    }

    /// 查询服务器已存在的分片，返回 None 表示不支持断点续传
    async fn list_existing_parts(&self, _file: &FileDescriptor) -> Result<Option<Vec<ExistingPart>>> {
        Ok(None)
    }

    /// 上传单个分片
    async fn upload_part(&self, file: &FileDescriptor, chunk: ChunkPayload) -> Result<UploadPartResponse> {
        anyhow::bail!(
            "传输层未实现 upload_part: file={}, part={}",
            file.name,
            chunk.part_number
        )
    }

    /// 合并分片，`parts` 已按编号排序
    async fn finalize(&self, _file: &FileDescriptor, _parts: &[CommittedPart]) -> Result<FinalizeResponse> {
        Ok(FinalizeResponse::default())
    }

    /// 通知服务器暂停（尽力而为）
    async fn notify_pause(&self, _file: &FileDescriptor) -> Result<()> {
        Ok(())
    }
}
