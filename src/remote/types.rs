// 远端对象存储 API 数据类型

use serde::{Deserialize, Serialize};
use std::fmt;

/// 服务端返回的对象元数据
///
/// `fs_id != 0` 当且仅当文件已在服务端落盘
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// 文件服务器ID
    #[serde(default)]
    pub fs_id: u64,

    /// 文件 MD5
    #[serde(default)]
    pub md5: String,

    /// 文件大小（字节）
    #[serde(default)]
    pub size: u64,

    /// 服务端路径
    #[serde(default)]
    pub path: String,

    /// 服务端文件名
    #[serde(default)]
    pub server_filename: String,

    /// 服务器创建时间
    #[serde(default)]
    pub ctime: i64,

    /// 服务器修改时间
    #[serde(default)]
    pub mtime: i64,
}

impl ObjectMetadata {
    /// 文件是否已在服务端落盘
    pub fn is_materialized(&self) -> bool {
        self.fs_id != 0
    }
}

/// 协议错误类别（按服务端 errno 分类）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrnoKind {
    /// 参数错误
    BadRequest,
    /// 权限不足
    Forbidden,
    /// 文件不存在
    FileNotFound,
    /// 校验失败（MD5 不匹配）
    ChecksumFailed,
    /// 限流
    RateLimited,
    /// 空间不足
    QuotaExceeded,
    /// 服务端内部错误
    ServerError,
    /// 未知错误
    Unknown,
}

impl ErrnoKind {
    /// 从服务端 errno 转换
    pub fn from_code(code: i32) -> Self {
        match code {
            2 | 31061 => ErrnoKind::BadRequest,
            -5 | 31062 | 31063 => ErrnoKind::Forbidden,
            404 | 31066 => ErrnoKind::FileNotFound,
            31079 => ErrnoKind::ChecksumFailed,
            31023 | 31024 => ErrnoKind::RateLimited,
            31064 | 31083 => ErrnoKind::QuotaExceeded,
            -1 | -3 | -11 => ErrnoKind::ServerError,
            _ => ErrnoKind::Unknown,
        }
    }
}

/// 传输层错误
///
/// 区分两类失败：
/// - `Errno`：服务端返回了已识别错误码的协议错误（致命，不重试）
/// - `Transport`：网络/解析等传输故障（由调用方按阶段规则重试）
#[derive(Debug)]
pub enum RemoteError {
    /// 协议错误（携带服务端错误码）
    Errno { code: i32, message: String },
    /// 传输故障
    Transport(anyhow::Error),
}

impl RemoteError {
    pub fn errno(code: i32, message: impl Into<String>) -> Self {
        RemoteError::Errno {
            code,
            message: message.into(),
        }
    }

    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        RemoteError::Transport(err.into())
    }

    /// 是否为协议错误
    pub fn is_errno(&self) -> bool {
        matches!(self, RemoteError::Errno { .. })
    }

    /// 协议错误码（传输故障返回 None）
    pub fn code(&self) -> Option<i32> {
        match self {
            RemoteError::Errno { code, .. } => Some(*code),
            RemoteError::Transport(_) => None,
        }
    }

    /// 协议错误类别
    pub fn kind(&self) -> Option<ErrnoKind> {
        self.code().map(ErrnoKind::from_code)
    }

    /// 秒传未命中（文件不在服务端或摘要校验失败，应回退普通上传）
    pub fn is_rapid_miss(&self) -> bool {
        matches!(
            self.kind(),
            Some(ErrnoKind::FileNotFound) | Some(ErrnoKind::ChecksumFailed)
        )
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Errno { code, message } => {
                write!(f, "协议错误: errno={}, {}", code, message)
            }
            RemoteError::Transport(e) => write!(f, "传输故障: {}", e),
        }
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RemoteError::Errno { .. } => None,
            RemoteError::Transport(e) => e.source(),
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

// =====================================================
// HTTP 接口响应类型
// =====================================================

/// 预创建响应
#[derive(Debug, Deserialize)]
pub struct PrecreateResponse {
    /// 错误码（0 表示成功）
    pub errno: i32,

    /// 上传会话ID（用于后续分片上传）
    #[serde(default)]
    pub uploadid: String,

    /// 错误信息
    #[serde(default)]
    pub errmsg: String,
}

/// 上传分片响应
#[derive(Debug, Deserialize)]
pub struct UploadSliceResponse {
    /// 错误码（0 表示成功）
    #[serde(default)]
    pub error_code: i32,

    /// 分片标识（服务端返回的分片 MD5）
    #[serde(default)]
    pub md5: String,

    /// 请求ID
    #[serde(default)]
    pub request_id: u64,

    /// 错误信息
    #[serde(default)]
    pub error_msg: String,
}

/// 合并分片（创建文件）响应
#[derive(Debug, Deserialize)]
pub struct CreateFileResponse {
    /// 错误码（0 表示成功）
    pub errno: i32,

    /// 对象元数据（errno == 0 时有效；fs_id == 0 表示需要重试）
    #[serde(flatten)]
    pub meta: ObjectMetadata,

    /// 错误信息
    #[serde(default)]
    pub errmsg: String,
}

/// 秒传响应
///
/// errno 语义:
/// - 0: 秒传成功
/// - 404: 服务端无此内容（需要普通上传）
/// - 31079: 摘要校验失败（需要普通上传）
#[derive(Debug, Deserialize)]
pub struct RapidUploadResponse {
    pub errno: i32,

    #[serde(flatten)]
    pub meta: ObjectMetadata,

    #[serde(default)]
    pub errmsg: String,
}
