// 网盘分片上传引擎核心库

// 配置管理模块
pub mod config;

// 日志系统
pub mod logging;

// 远端对象存储接口与 HTTP 客户端
pub mod remote;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{LogConfig, OnDuplicate, UploadConfig};
pub use remote::{HttpRemote, HttpRemoteConfig, ObjectMetadata, RemoteError, RemoteStore};
pub use uploader::{
    HashingFilter, Passthrough, RapidUploadDigests, SourceFilter, SpeedLimiter, TaskState,
    TrackedFile, UploadEvent, UploadTask, Uploader, UploaderPool,
};
