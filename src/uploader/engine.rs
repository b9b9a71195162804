// 上传引擎（单文件状态机）
//
// 上传流程：
// 1. 计算秒传摘要（调用方已提供则跳过）
// 2. 尝试秒传；命中则直接完成
// 3. 预创建拿到会话ID，逐片顺序上传
// 4. 合并分片，校验服务端返回的大小与 MD5
//
// 取消与暂停都是协作式的：两个令牌在每个阻塞点与在途请求竞争，
// 暂停保留 accepted_slices / 会话ID / 摘要，恢复时从当前阶段重新进入

use crate::remote::{ObjectMetadata, RemoteStore};
use crate::uploader::hash::HashingFilter;
use crate::uploader::limit::SpeedLimiter;
use crate::uploader::slice::{SliceTransferError, SliceTransport, HEAD_DIGEST_SIZE, SLICE_SIZE};
use crate::uploader::source::SourceFilter;
use crate::uploader::task::{TaskState, TrackedFile, UploadEvent, UploadTask};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 瞬态重试间隔（空分片标识、fs_id=0、传输故障）
const RETRY_DELAY_MS: u64 = 200;

/// 阻塞点竞争结果
enum Flow<T> {
    Done(T),
    Cancelled,
    Paused,
}

/// 上传引擎
///
/// 每次启动（含恢复）创建一个引擎实例驱动任务；
/// 任务状态经 `Arc<Mutex<UploadTask>>` 与上传池共享
pub struct Uploader {
    task_id: u64,
    task: Arc<Mutex<UploadTask>>,
    remote: Arc<dyn RemoteStore>,
    source: Arc<dyn SourceFilter>,
    limiter: Arc<SpeedLimiter>,
    /// 已上传字节热计数（进度回调高频写入，采样器读取）
    bytes_uploaded: Arc<AtomicU64>,
    /// 取消令牌（任务整个生命周期有效）
    cancel: CancellationToken,
    /// 暂停令牌（每次启动新建）
    pause: CancellationToken,
    events: mpsc::UnboundedSender<UploadEvent>,
    enable_rapid_upload: bool,
}

impl Uploader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: u64,
        task: Arc<Mutex<UploadTask>>,
        remote: Arc<dyn RemoteStore>,
        source: Arc<dyn SourceFilter>,
        limiter: Arc<SpeedLimiter>,
        bytes_uploaded: Arc<AtomicU64>,
        cancel: CancellationToken,
        pause: CancellationToken,
        events: mpsc::UnboundedSender<UploadEvent>,
        enable_rapid_upload: bool,
    ) -> Self {
        Self {
            task_id,
            task,
            remote,
            source,
            limiter,
            bytes_uploaded,
            cancel,
            pause,
            events,
            enable_rapid_upload,
        }
    }

    /// 执行上传，直到终态、暂停或取消
    pub async fn run(self) {
        // 速度采样器随引擎退出自动停止
        let sampler_stop = CancellationToken::new();
        let _sampler_guard = sampler_stop.clone().drop_guard();
        self.spawn_speed_sampler(sampler_stop);

        match self.drive().await {
            Flow::Done(()) => {}
            Flow::Cancelled => self.finish_cancelled(None).await,
            Flow::Paused => self.enter_paused().await,
        }
    }

    async fn drive(&self) -> Flow<()> {
        let (local_path, remote_path, on_dup, digests_ready) = {
            let t = self.task.lock().await;
            if t.state.is_terminal() {
                return Flow::Done(());
            }
            let ready = !t.content_md5.is_empty()
                && !t.content_crc32.is_empty()
                && t.slice_count > 0
                && (!t.slice_md5.is_empty() || t.content_length < HEAD_DIGEST_SIZE);
            (
                t.local_path.clone(),
                t.remote_path.clone(),
                t.on_duplicate,
                ready,
            )
        };

        info!(
            "任务 #{} 启动: local={:?}, remote={}",
            self.task_id, local_path, remote_path
        );
        self.send(UploadEvent::Started {
            task_id: self.task_id,
        });

        // ===== 阶段一：摘要计算 =====
        if !digests_ready {
            {
                let mut t = self.task.lock().await;
                t.mark_hashing();
            }

            let known = {
                let t = self.task.lock().await;
                let some_nonempty = |s: &str| {
                    if s.is_empty() {
                        None
                    } else {
                        Some(s.to_string())
                    }
                };
                TrackedFile {
                    local_path: t.local_path.clone(),
                    content_length: if t.slice_count > 0 {
                        Some(t.content_length)
                    } else {
                        None
                    },
                    content_md5: some_nonempty(&t.content_md5),
                    content_crc32: some_nonempty(&t.content_crc32),
                    slice_md5: some_nonempty(&t.slice_md5),
                }
            };

            let compute = HashingFilter::compute(self.source.clone(), known, None);
            match self.race(compute).await {
                Flow::Done(Ok(digests)) => {
                    let mut t = self.task.lock().await;
                    t.set_digests(
                        digests.content_length,
                        digests.content_md5,
                        digests.content_crc32,
                        digests.slice_md5,
                    );
                }
                Flow::Done(Err(e)) => {
                    self.finish_error(format!("摘要计算失败: {:#}", e)).await;
                    return Flow::Done(());
                }
                Flow::Cancelled => return Flow::Cancelled,
                Flow::Paused => return Flow::Paused,
            }
        }

        let (content_length, content_md5, content_crc32, slice_md5, slice_count, session_known) = {
            let mut t = self.task.lock().await;
            t.mark_transferring();
            (
                t.content_length,
                t.content_md5.clone(),
                t.content_crc32.clone(),
                t.slice_md5.clone(),
                t.slice_count,
                !t.upload_session_id.is_empty(),
            )
        };

        // ===== 阶段二：秒传尝试 =====
        // 仅当会话尚未建立、文件不小于 256KB 且 slice_md5 可用时
        if !session_known
            && self.enable_rapid_upload
            && content_length >= HEAD_DIGEST_SIZE
            && !slice_md5.is_empty()
        {
            let attempt = self.remote.rapid_upload(
                &remote_path,
                content_length,
                &content_md5,
                &content_crc32,
                &slice_md5,
                on_dup,
            );
            match self.race(attempt).await {
                Flow::Done(Ok(meta)) if meta.is_materialized() => {
                    info!("任务 #{} 秒传成功: fs_id={}", self.task_id, meta.fs_id);
                    self.bytes_uploaded.store(content_length, Ordering::SeqCst);
                    self.finish_verified(None).await;
                    return Flow::Done(());
                }
                Flow::Done(Ok(_)) => {
                    debug!("任务 #{} 秒传未落盘，转普通上传", self.task_id);
                }
                Flow::Done(Err(e)) if e.is_rapid_miss() => {
                    debug!("任务 #{} 秒传未命中: {}", self.task_id, e);
                }
                Flow::Done(Err(e)) => {
                    // 意外失败只通知，不终止任务
                    warn!("任务 #{} 秒传异常: {}", self.task_id, e);
                    self.send(UploadEvent::RapidUploadFailed {
                        task_id: self.task_id,
                        message: e.to_string(),
                    });
                }
                Flow::Cancelled => return Flow::Cancelled,
                Flow::Paused => return Flow::Paused,
            }
        }

        // ===== 阶段三：预创建 =====
        // 拿到会话ID或遇到协议错误前无限重试
        if !session_known {
            loop {
                match self.race(self.remote.precreate(&remote_path, slice_count)).await {
                    Flow::Done(Ok(session_id)) if !session_id.is_empty() => {
                        let mut t = self.task.lock().await;
                        t.upload_session_id = session_id;
                        break;
                    }
                    Flow::Done(Ok(_)) => {
                        warn!("任务 #{} 预创建未返回会话ID，重试", self.task_id);
                    }
                    Flow::Done(Err(e)) if e.is_errno() => {
                        self.finish_cancelled(Some(e.to_string())).await;
                        return Flow::Done(());
                    }
                    Flow::Done(Err(e)) => {
                        warn!("任务 #{} 预创建故障，重试: {}", self.task_id, e);
                    }
                    Flow::Cancelled => return Flow::Cancelled,
                    Flow::Paused => return Flow::Paused,
                }
                match self.retry_delay().await {
                    Flow::Done(()) => {}
                    Flow::Cancelled => return Flow::Cancelled,
                    Flow::Paused => return Flow::Paused,
                }
            }
        }

        let session_id = self.task.lock().await.upload_session_id.clone();

        // ===== 阶段四：分片传输 =====
        // 本地句柄在进入传输时打开，任何退出路径（完成/暂停/取消/失败）都会关闭；
        // 恢复时从已确认分片数续传
        let mut accepted = self.task.lock().await.accepted_slices.len();
        if accepted < slice_count {
            let mut stream = match self.source.open(&local_path) {
                Ok(s) => s,
                Err(e) => {
                    self.finish_error(format!("打开文件失败: {}", e)).await;
                    return Flow::Done(());
                }
            };

            while accepted < slice_count {
                let base = SLICE_SIZE * accepted as u64;
                let hot = self.bytes_uploaded.clone();
                let progress = move |current: u64| {
                    hot.store((base + current).min(content_length), Ordering::SeqCst);
                };

                let transport = SliceTransport::new(self.remote.as_ref(), self.limiter.as_ref());
                let transfer = transport.transfer(
                    stream,
                    &remote_path,
                    &session_id,
                    accepted,
                    content_length,
                    &progress,
                );

                match self.race(transfer).await {
                    Flow::Done(Ok((returned, slice_id))) => {
                        stream = returned;
                        if slice_id.is_empty() {
                            // 服务端要求原位重试，分片序号不前进
                            warn!(
                                "任务 #{} 分片 {} 返回空标识，原位重试",
                                self.task_id, accepted
                            );
                            match self.retry_delay().await {
                                Flow::Done(()) => continue,
                                Flow::Cancelled => return Flow::Cancelled,
                                Flow::Paused => return Flow::Paused,
                            }
                        }

                        let mut t = self.task.lock().await;
                        t.accepted_slices.push(slice_id);
                        accepted = t.accepted_slices.len();
                        let done = (SLICE_SIZE * accepted as u64).min(content_length);
                        t.bytes_uploaded = done;
                        drop(t);
                        self.bytes_uploaded.store(done, Ordering::SeqCst);

                        debug!(
                            "任务 #{} 分片确认 {}/{}",
                            self.task_id, accepted, slice_count
                        );
                    }
                    Flow::Done(Err(SliceTransferError::Io(e))) => {
                        self.finish_error(format!("{:#}", e)).await;
                        return Flow::Done(());
                    }
                    Flow::Done(Err(SliceTransferError::Remote(e))) => {
                        self.finish_cancelled(Some(e.to_string())).await;
                        return Flow::Done(());
                    }
                    Flow::Cancelled => return Flow::Cancelled,
                    Flow::Paused => return Flow::Paused,
                }
            }
        }

        // ===== 阶段五：合并与校验 =====
        let slice_ids = self.task.lock().await.accepted_slices.clone();
        loop {
            let finalize = self.remote.create_super_file(
                &remote_path,
                &session_id,
                &slice_ids,
                content_length,
                on_dup,
            );
            match self.race(finalize).await {
                Flow::Done(Ok(meta)) => {
                    if !meta.is_materialized() {
                        // fs_id == 0: 服务端尚未就绪
                        debug!("任务 #{} 合并未就绪，重试", self.task_id);
                        match self.retry_delay().await {
                            Flow::Done(()) => continue,
                            Flow::Cancelled => return Flow::Cancelled,
                            Flow::Paused => return Flow::Paused,
                        }
                    }

                    let failure = verify_metadata(content_length, &content_md5, &meta);
                    if failure.is_none() {
                        info!(
                            "任务 #{} 上传完成: fs_id={}, size={}",
                            self.task_id, meta.fs_id, meta.size
                        );
                    } else {
                        warn!("任务 #{} 校验不一致: {:?}", self.task_id, failure);
                    }
                    self.finish_verified(failure).await;
                    return Flow::Done(());
                }
                Flow::Done(Err(e)) if e.is_errno() => {
                    self.finish_cancelled(Some(e.to_string())).await;
                    return Flow::Done(());
                }
                Flow::Done(Err(e)) => {
                    warn!("任务 #{} 合并故障，重试: {}", self.task_id, e);
                    match self.retry_delay().await {
                        Flow::Done(()) => {}
                        Flow::Cancelled => return Flow::Cancelled,
                        Flow::Paused => return Flow::Paused,
                    }
                }
                Flow::Cancelled => return Flow::Cancelled,
                Flow::Paused => return Flow::Paused,
            }
        }
    }

    /// 在阻塞点让在途操作与取消/暂停令牌竞争
    async fn race<F, T>(&self, fut: F) -> Flow<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Flow::Cancelled,
            _ = self.pause.cancelled() => Flow::Paused,
            out = fut => Flow::Done(out),
        }
    }

    async fn retry_delay(&self) -> Flow<()> {
        self.race(tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)))
            .await
    }

    fn send(&self, event: UploadEvent) {
        let _ = self.events.send(event);
    }

    async fn enter_paused(&self) {
        let mut t = self.task.lock().await;
        if t.state.is_terminal() {
            return;
        }
        t.mark_paused();
        self.bytes_uploaded.store(t.bytes_uploaded, Ordering::SeqCst);
        drop(t);

        info!("任务 #{} 已暂停", self.task_id);
        self.send(UploadEvent::Paused {
            task_id: self.task_id,
        });
    }

    async fn finish_cancelled(&self, error: Option<String>) {
        let mut t = self.task.lock().await;
        if t.state.is_terminal() {
            return;
        }
        t.mark_cancelled(error.clone());
        drop(t);

        info!("任务 #{} 已取消: {:?}", self.task_id, error);
        self.send(UploadEvent::Cancelled {
            task_id: self.task_id,
            error,
        });
    }

    async fn finish_error(&self, message: String) {
        let mut t = self.task.lock().await;
        if t.state.is_terminal() {
            return;
        }
        t.mark_error(message.clone());
        drop(t);

        warn!("任务 #{} 失败: {}", self.task_id, message);
        self.send(UploadEvent::Error {
            task_id: self.task_id,
            message,
        });
    }

    async fn finish_verified(&self, failure: Option<String>) {
        let mut t = self.task.lock().await;
        if t.state.is_terminal() {
            return;
        }
        t.mark_finished(failure.clone());
        t.bytes_uploaded = t
            .bytes_uploaded
            .max(self.bytes_uploaded.load(Ordering::SeqCst));
        drop(t);

        self.send(UploadEvent::Finished {
            task_id: self.task_id,
            success: failure.is_none(),
            failure,
        });
    }

    /// 启动 1Hz 速度采样器：瞬时速度 = 本秒新增字节数
    fn spawn_speed_sampler(&self, stop: CancellationToken) {
        let task = self.task.clone();
        let bytes = self.bytes_uploaded.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await; // 首个 tick 立即完成
            let mut prev = bytes.load(Ordering::SeqCst);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        let current = bytes.load(Ordering::SeqCst);
                        let speed = current.saturating_sub(prev);
                        prev = current;

                        let mut t = task.lock().await;
                        if t.state.is_terminal() {
                            break;
                        }
                        // 暂停回退进度后不再覆盖
                        if t.state == TaskState::Paused {
                            continue;
                        }
                        t.instantaneous_speed = speed;
                        t.bytes_uploaded = if t.content_length > 0 {
                            current.min(t.content_length)
                        } else {
                            current
                        };
                    }
                }
            }
        });
    }
}

/// 合并后的一致性校验：大小必须一致；本地已知 MD5 且服务端有回报时必须一致
fn verify_metadata(
    content_length: u64,
    content_md5: &str,
    meta: &ObjectMetadata,
) -> Option<String> {
    if !content_md5.is_empty()
        && !meta.md5.is_empty()
        && !meta.md5.eq_ignore_ascii_case(content_md5)
    {
        return Some(format!(
            "MD5 不一致: local={}, server={}",
            content_md5, meta.md5
        ));
    }
    if meta.size != content_length {
        return Some(format!(
            "大小不一致: local={}, server={}",
            content_length, meta.size
        ));
    }
    None
}
