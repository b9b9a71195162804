// 上传引擎模块
//
// 组件自底向上：
// - hash:   秒传摘要计算（完整 MD5 / CRC32 / 前 256KB MD5）
// - slice:  4MB 窗口的分片传输
// - limit:  令牌桶限速，带宽由上传池统一分配
// - source: 源过滤器（默认直通；加密上传由外部过滤器接入）
// - engine: 单文件状态机（秒传 → 分片 → 合并 → 校验）
// - pool:   有界并发的上传池（准入、限速分摊、事件广播、自动递补）

pub mod engine;
pub mod hash;
pub mod limit;
pub mod pool;
pub mod slice;
pub mod source;
pub mod task;

pub use engine::Uploader;
pub use hash::{HashProgress, HashingFilter, RapidUploadDigests};
pub use limit::SpeedLimiter;
pub use pool::UploaderPool;
pub use slice::{slice_count, SliceTransport, HEAD_DIGEST_SIZE, SLICE_SIZE};
pub use source::{Passthrough, SourceFilter, SourceStream};
pub use task::{TaskState, TrackedFile, UploadEvent, UploadTask};
