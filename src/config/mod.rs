// 配置管理模块

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 同名文件处理策略（上报给服务端的 ondup 参数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnDuplicate {
    /// 覆盖同名文件
    Overwrite,
    /// 生成副本（服务端自动重命名）
    NewCopy,
    /// 跳过，保留服务端文件
    Skip,
}

impl Default for OnDuplicate {
    fn default() -> Self {
        OnDuplicate::Overwrite
    }
}

impl OnDuplicate {
    /// 协议字符串（precreate/rapidupload/create 接口的 ondup 取值）
    pub fn as_wire(&self) -> &'static str {
        match self {
            OnDuplicate::Overwrite => "overwrite",
            OnDuplicate::NewCopy => "newcopy",
            OnDuplicate::Skip => "skip",
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大同时上传文件数
    pub pool_size: usize,
    /// 全局限速 (bytes/s)，0 表示不限速
    pub total_speed_limit_bps: u64,
    /// 单任务最大传输线程数（透传给传输层）
    pub max_threads_per_task: usize,
    /// 同名文件处理策略
    #[serde(default)]
    pub on_duplicate: OnDuplicate,
    /// 是否通过外部加密过滤器上传（上传密文流）
    #[serde(default)]
    pub encrypt: bool,
    /// 是否启用秒传
    pub enable_rapid_upload: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            total_speed_limit_bps: 0, // 默认不限速
            max_threads_per_task: 1,
            on_duplicate: OnDuplicate::Overwrite,
            encrypt: false,
            enable_rapid_upload: true,
        }
    }
}

impl UploadConfig {
    /// 校验配置合法性
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool_size == 0 {
            anyhow::bail!("pool_size 必须大于 0");
        }
        if self.max_threads_per_task == 0 {
            anyhow::bail!("max_threads_per_task 必须大于等于 1");
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志目录
    pub log_dir: PathBuf,
    /// 日志级别 (trace/debug/info/warn/error)
    pub level: String,
    /// 是否输出到文件
    pub file_enabled: bool,
    /// 单个日志文件最大大小 (MB)
    pub max_file_size_mb: u64,
    /// 日志保留天数，超期自动清理
    pub retention_days: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            level: "info".to_string(),
            file_enabled: true,
            max_file_size_mb: 20,
            retention_days: 7,
        }
    }
}
