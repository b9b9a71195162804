// 上传任务定义

use crate::config::OnDuplicate;
use crate::uploader::slice::{slice_count, SLICE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 上传输入描述
///
/// 摘要字段可由调用方预先提供（例如来自本地元数据缓存），
/// 提供即视为可信；过期摘要由调用方负责
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackedFile {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 文件大小
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    /// 完整内容 MD5
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_md5: Option<String>,
    /// 内容 CRC32
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_crc32: Option<String>,
    /// 前 256KB MD5（文件不足 256KB 时为空）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slice_md5: Option<String>,
}

impl TrackedFile {
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            ..Default::default()
        }
    }
}

/// 任务生命周期状态
///
/// Cancelled / Error / Finished 为吸收态：不再发生状态迁移，也不再发出事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// 已入队，等待启动
    Init,
    /// 摘要计算中
    Hashing,
    /// 传输中（秒传尝试、预创建、分片、合并）
    Transferring,
    /// 已暂停
    Paused,
    /// 已取消
    Cancelled,
    /// 失败
    Error,
    /// 已完成
    Finished,
}

impl TaskState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Cancelled | TaskState::Error | TaskState::Finished
        )
    }
}

/// 任务生命周期事件
///
/// 单个任务的事件全序：Started 先于其后全部事件；
/// Finished / Cancelled / Error 三者恰好出现一个，且是最后一个
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 任务启动
    Started { task_id: u64 },
    /// 任务暂停
    Paused { task_id: u64 },
    /// 任务取消（用户取消或协议错误，error 字段区分）
    Cancelled { task_id: u64, error: Option<String> },
    /// 任务失败
    Error { task_id: u64, message: String },
    /// 任务结束（success=false 时为校验不一致，failure 说明原因）
    Finished {
        task_id: u64,
        success: bool,
        failure: Option<String>,
    },
    /// 秒传意外失败（非致命通知，任务继续走普通上传）
    RapidUploadFailed { task_id: u64, message: String },
}

impl UploadEvent {
    /// 事件所属任务
    pub fn task_id(&self) -> u64 {
        match self {
            UploadEvent::Started { task_id }
            | UploadEvent::Paused { task_id }
            | UploadEvent::Cancelled { task_id, .. }
            | UploadEvent::Error { task_id, .. }
            | UploadEvent::Finished { task_id, .. }
            | UploadEvent::RapidUploadFailed { task_id, .. } => *task_id,
        }
    }

    /// 是否为终结事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadEvent::Cancelled { .. }
                | UploadEvent::Error { .. }
                | UploadEvent::Finished { .. }
        )
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID（由上传池单调分配）
    pub task_id: u64,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 网盘目标路径
    pub remote_path: String,
    /// 任务状态
    pub state: TaskState,
    /// 同名文件处理策略
    pub on_duplicate: OnDuplicate,

    // === 协议状态 ===
    /// 上传会话ID（precreate 成功前为空；一经设置不再变更）
    pub upload_session_id: String,
    /// 总分片数
    pub slice_count: usize,
    /// 已确认的分片标识（按分片序号严格排列）
    pub accepted_slices: Vec<String>,

    // === 摘要状态 ===
    /// 文件大小
    pub content_length: u64,
    /// 完整内容 MD5
    pub content_md5: String,
    /// 内容 CRC32
    pub content_crc32: String,
    /// 前 256KB MD5（文件不足 256KB 时为空）
    pub slice_md5: String,

    // === 进度 ===
    /// 已上传字节数（运行期内单调；暂停时回退到 4MB × 已确认分片数）
    pub bytes_uploaded: u64,
    /// 瞬时速度 (bytes/s)，每秒采样一次
    pub instantaneous_speed: u64,

    /// 错误信息
    pub error: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 结束时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(
        task_id: u64,
        file: &TrackedFile,
        remote_path: String,
        on_duplicate: OnDuplicate,
    ) -> Self {
        let content_length = file.content_length.unwrap_or(0);
        Self {
            task_id,
            local_path: file.local_path.clone(),
            remote_path,
            state: TaskState::Init,
            on_duplicate,
            upload_session_id: String::new(),
            slice_count: if file.content_length.is_some() {
                slice_count(content_length)
            } else {
                0
            },
            accepted_slices: Vec::new(),
            content_length,
            content_md5: file.content_md5.clone().unwrap_or_default(),
            content_crc32: file.content_crc32.clone().unwrap_or_default(),
            slice_md5: file.slice_md5.clone().unwrap_or_default(),
            bytes_uploaded: 0,
            instantaneous_speed: 0,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 进度百分比
    pub fn progress(&self) -> f64 {
        if self.content_length == 0 {
            return 0.0;
        }
        (self.bytes_uploaded as f64 / self.content_length as f64) * 100.0
    }

    /// 写入摘要并确定分片数
    pub fn set_digests(&mut self, length: u64, md5: String, crc32: String, slice_md5: String) {
        self.content_length = length;
        self.content_md5 = md5;
        self.content_crc32 = crc32;
        self.slice_md5 = slice_md5;
        self.slice_count = slice_count(length);
    }

    /// 标记为摘要计算中
    pub fn mark_hashing(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TaskState::Hashing;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为传输中
    pub fn mark_transferring(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TaskState::Transferring;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为暂停
    ///
    /// 进度回退到已确认分片的整分片字节数，避免进度条倒挂半途废弃的分片
    pub fn mark_paused(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TaskState::Paused;
        self.instantaneous_speed = 0;
        self.bytes_uploaded =
            (SLICE_SIZE * self.accepted_slices.len() as u64).min(self.content_length);
    }

    /// 标记为取消
    pub fn mark_cancelled(&mut self, error: Option<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TaskState::Cancelled;
        self.instantaneous_speed = 0;
        if error.is_some() {
            self.error = error;
        }
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为失败
    pub fn mark_error(&mut self, message: String) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TaskState::Error;
        self.instantaneous_speed = 0;
        self.error = Some(message);
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为完成
    ///
    /// `failure` 非空表示校验不一致（success=false 的完成）；
    /// 此时状态落在 Error，但终结事件仍是 Finished
    pub fn mark_finished(&mut self, failure: Option<String>) {
        if self.state.is_terminal() {
            return;
        }
        match failure {
            None => {
                self.state = TaskState::Finished;
                self.bytes_uploaded = self.content_length;
            }
            Some(message) => {
                self.state = TaskState::Error;
                self.error = Some(message);
            }
        }
        self.instantaneous_speed = 0;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_task(length: Option<u64>) -> UploadTask {
        let mut file = TrackedFile::new("./test/file.bin");
        file.content_length = length;
        UploadTask::new(1, &file, "/test/file.bin".to_string(), OnDuplicate::default())
    }

    #[test]
    fn test_task_creation() {
        let task = test_task(Some(10 * 1024 * 1024));
        assert_eq!(task.state, TaskState::Init);
        assert_eq!(task.slice_count, 3);
        assert_eq!(task.bytes_uploaded, 0);
        assert!(task.upload_session_id.is_empty());
        assert!(task.accepted_slices.is_empty());
    }

    #[test]
    fn test_set_digests_updates_slice_count() {
        let mut task = test_task(None);
        assert_eq!(task.slice_count, 0);

        task.set_digests(
            SLICE_SIZE + 1,
            "md5".to_string(),
            "crc".to_string(),
            "smd5".to_string(),
        );
        assert_eq!(task.slice_count, 2);
        assert_eq!(task.content_length, SLICE_SIZE + 1);
    }

    #[test]
    fn test_pause_rolls_back_progress() {
        let mut task = test_task(Some(10 * 1024 * 1024));
        task.mark_transferring();
        task.accepted_slices.push("sid-0".to_string());
        task.bytes_uploaded = SLICE_SIZE + 12345; // 第二片传到一半

        task.mark_paused();
        assert_eq!(task.state, TaskState::Paused);
        assert_eq!(task.bytes_uploaded, SLICE_SIZE);
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let mut task = test_task(Some(1024));
        task.mark_cancelled(None);
        assert_eq!(task.state, TaskState::Cancelled);

        task.mark_transferring();
        assert_eq!(task.state, TaskState::Cancelled);
        task.mark_error("late".to_string());
        assert_eq!(task.state, TaskState::Cancelled);
        task.mark_finished(None);
        assert_eq!(task.state, TaskState::Cancelled);
    }

    #[test]
    fn test_finished_with_failure_lands_in_error() {
        let mut task = test_task(Some(1024));
        task.mark_transferring();
        task.mark_finished(Some("MD5 不一致".to_string()));

        assert_eq!(task.state, TaskState::Error);
        assert_eq!(task.error.as_deref(), Some("MD5 不一致"));
    }

    #[test]
    fn test_event_accessors() {
        let event = UploadEvent::Finished {
            task_id: 7,
            success: true,
            failure: None,
        };
        assert_eq!(event.task_id(), 7);
        assert!(event.is_terminal());

        let event = UploadEvent::RapidUploadFailed {
            task_id: 7,
            message: "x".to_string(),
        };
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_progress_calculation() {
        let mut task = test_task(Some(1000));
        assert_eq!(task.progress(), 0.0);
        task.bytes_uploaded = 250;
        assert_eq!(task.progress(), 25.0);

        let empty = test_task(Some(0));
        assert_eq!(empty.progress(), 0.0);
    }
}
