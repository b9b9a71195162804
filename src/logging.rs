//! 日志系统
//!
//! 控制台与文件双路输出。活跃日志固定为 pan-uploader.log，写满后整体
//! 改名为带时间戳的归档文件，归档按文件修改时间过期清理

use crate::config::LogConfig;
use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 活跃日志文件名
const ACTIVE_LOG_NAME: &str = "pan-uploader.log";

/// 归档文件名前缀
const ARCHIVE_PREFIX: &str = "pan-uploader.";

/// 按大小归档的日志写入器
///
/// 始终写入固定名的活跃文件；超过大小上限时把活跃文件改名归档，
/// 再从零开始写新的活跃文件。句柄按需打开，进程重启后从既有
/// 文件末尾续写。由 tracing-appender 的后台线程独占驱动，无需加锁
pub struct RotatingLog {
    log_dir: PathBuf,
    max_file_size: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingLog {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> Self {
        Self {
            log_dir,
            max_file_size,
            file: None,
            written: 0,
        }
    }

    fn active_path(&self) -> PathBuf {
        self.log_dir.join(ACTIVE_LOG_NAME)
    }

    /// 把写满的活跃文件改名归档
    fn archive(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }

        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let mut target = self.log_dir.join(format!("{}{}.log", ARCHIVE_PREFIX, stamp));
        // 同一秒内多次归档时追加序号避免覆盖
        let mut seq = 1;
        while target.exists() {
            target = self
                .log_dir
                .join(format!("{}{}-{}.log", ARCHIVE_PREFIX, stamp, seq));
            seq += 1;
        }

        fs::rename(self.active_path(), target)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.archive()?;
        }

        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.active_path())?;
            self.written = file.metadata()?.len();
            self.file = Some(file);
        }
        let Some(file) = &mut self.file else {
            return Err(io::Error::new(io::ErrorKind::Other, "日志句柄丢失"));
        };

        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        Ok(())
    }
}

/// 日志系统守卫
///
/// 守卫存活期间文件写入线程才会运行
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// # 参数
/// * `config` - 日志配置
///
/// # 返回
/// 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let console = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(true);
    let registry = tracing_subscriber::registry().with(filter).with(console);

    match file_writer(config) {
        Some(writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let file_layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
                .with_ansi(false)
                .with_writer(non_blocking);
            registry.with(file_layer).init();

            info!(
                "日志系统初始化完成: 目录={:?}, 级别={}, 单文件最大={}MB, 保留{}天",
                config.log_dir, config.level, config.max_file_size_mb, config.retention_days
            );
            sweep_expired_archives(&config.log_dir, config.retention_days);

            LogGuard {
                _file_guard: Some(guard),
            }
        }
        None => {
            registry.init();
            info!("日志系统初始化完成（仅控制台输出）");
            LogGuard { _file_guard: None }
        }
    }
}

/// 文件输出可用时构造写入器；目录创建失败退回仅控制台
fn file_writer(config: &LogConfig) -> Option<RotatingLog> {
    if !config.file_enabled {
        return None;
    }
    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}", config.log_dir, e);
        return None;
    }
    Some(RotatingLog::new(
        config.log_dir.clone(),
        config.max_file_size_mb * 1024 * 1024,
    ))
}

/// 清理过期归档
///
/// 只看文件修改时间，不解析文件名；活跃日志不受影响
fn sweep_expired_archives(log_dir: &Path, retention_days: u32) {
    let deadline = match SystemTime::now()
        .checked_sub(Duration::from_secs(retention_days as u64 * 86400))
    {
        Some(t) => t,
        None => return,
    };

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|s| s.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if name == ACTIVE_LOG_NAME || !name.starts_with(ARCHIVE_PREFIX) || !name.ends_with(".log")
        {
            continue;
        }

        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|mtime| mtime < deadline)
            .unwrap_or(false);
        if expired {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("删除过期日志失败: {:?}, 错误: {}", path, e),
            }
        }
    }

    if removed > 0 {
        info!("已清理 {} 个过期日志归档", removed);
    }
}
