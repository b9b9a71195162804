// 远端对象存储接口
//
// 上传引擎只依赖 RemoteStore trait；具体实现（HTTP 客户端、测试桩）
// 由调用方注入，核心不持有任何进程级单例

pub mod client;
pub mod types;

pub use client::{HttpRemote, HttpRemoteConfig};
pub use types::{
    CreateFileResponse, ErrnoKind, ObjectMetadata, PrecreateResponse, RapidUploadResponse,
    RemoteError, RemoteResult, UploadSliceResponse,
};

use crate::config::OnDuplicate;
use async_trait::async_trait;

/// 远端对象存储的消费接口
///
/// 三段式分片上传协议 (precreate → upload_slice → create_super_file)
/// 外加按内容摘要的秒传捷径
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 秒传：凭 (完整 MD5, CRC32, 前 256KB MD5) 尝试直接落盘
    ///
    /// 成功时返回 `fs_id != 0` 的元数据；未命中以协议错误形式返回
    /// （errno 404 / 31079，见 `RemoteError::is_rapid_miss`）
    async fn rapid_upload(
        &self,
        remote_path: &str,
        content_length: u64,
        content_md5: &str,
        content_crc32: &str,
        slice_md5: &str,
        on_dup: OnDuplicate,
    ) -> RemoteResult<ObjectMetadata>;

    /// 预创建：为后续分片上传分配会话ID
    async fn precreate(&self, remote_path: &str, slice_count: usize) -> RemoteResult<String>;

    /// 上传一个分片，返回服务端分片标识
    ///
    /// 服务端可能成功返回空标识，表示该分片需要原位重试
    async fn upload_slice(
        &self,
        remote_path: &str,
        upload_session_id: &str,
        slice_index: usize,
        data: Vec<u8>,
    ) -> RemoteResult<String>;

    /// 合并分片，创建最终文件
    ///
    /// 返回 `fs_id == 0` 的元数据表示服务端尚未就绪，需要重试
    async fn create_super_file(
        &self,
        remote_path: &str,
        upload_session_id: &str,
        slice_ids: &[String],
        content_length: u64,
        on_dup: OnDuplicate,
    ) -> RemoteResult<ObjectMetadata>;
}
