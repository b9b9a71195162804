// 上传池
//
// 有界并发调度：
// - 同时运行的任务数不超过 pool_size，其余按入队顺序等待
// - 任一任务终结时自动递补下一个等待任务
// - 全局限速在运行任务间均分，成员或限速变化时重新分配
// - 任务事件经单一通道汇入池内，再广播给订阅者；
//   订阅者掉队或退出不影响池本身
//
// 控制操作（入队/启动/暂停/取消/销毁）都在池锁内完成，
// 锁内不发起任何远端请求

use crate::config::UploadConfig;
use crate::remote::RemoteStore;
use crate::uploader::engine::Uploader;
use crate::uploader::limit::SpeedLimiter;
use crate::uploader::source::SourceFilter;
use crate::uploader::task::{TrackedFile, UploadEvent, UploadTask};
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 广播通道容量（掉队的订阅者丢最旧事件）
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 单个任务在池中的登记信息
struct TaskHandle {
    task: Arc<Mutex<UploadTask>>,
    /// 取消令牌（任务整个生命周期有效）
    cancel: CancellationToken,
    /// 暂停令牌（仅在运行期间存在，每次启动新建）
    pause: Option<CancellationToken>,
    /// 该任务的带宽配额
    limiter: Arc<SpeedLimiter>,
    /// 已上传字节热计数（跨暂停/恢复保持同一实例）
    bytes_uploaded: Arc<AtomicU64>,
    /// 是否有工作器在运行
    running: bool,
}

/// 池内可变状态，整体受池锁保护
struct PoolState {
    /// 任务表（BTreeMap 保证按任务ID即入队顺序遍历）
    tasks: BTreeMap<u64, TaskHandle>,
    /// 下一个任务ID（单调递增）
    next_task_id: u64,
    /// 自动启动开关
    auto_start: bool,
    /// 最大同时运行任务数
    pool_size: usize,
    /// 全局限速 (bytes/s)，0 = 不限速
    total_speed_limit: u64,
    /// 销毁哨兵：置位后一切控制操作直接报错
    disposed: bool,
}

impl PoolState {
    fn running_count(&self) -> usize {
        self.tasks.values().filter(|h| h.running).count()
    }

    /// 重新分配带宽：每个任务得到 total / min(任务数, pool_size)
    fn reapportion(&mut self) {
        let share = if self.total_speed_limit == 0 {
            0
        } else {
            let denom = self.tasks.len().min(self.pool_size).max(1);
            self.total_speed_limit / denom as u64
        };
        for handle in self.tasks.values() {
            handle.limiter.set_rate(share);
        }
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    remote: Arc<dyn RemoteStore>,
    source: Arc<dyn SourceFilter>,
    /// 对外广播
    events_tx: broadcast::Sender<UploadEvent>,
    /// 任务事件汇入通道（引擎与池控制共用，保证单任务事件全序）
    task_events: mpsc::UnboundedSender<UploadEvent>,
    enable_rapid_upload: bool,
    on_duplicate: crate::config::OnDuplicate,
    /// 单任务最大传输线程数（透传给传输层的配置项）
    max_threads_per_task: AtomicUsize,
}

impl PoolShared {
    /// 启动任务（须持有池锁）。返回是否真正启动了工作器
    async fn start_locked(&self, state: &mut PoolState, task_id: u64) -> bool {
        let handle = match state.tasks.get_mut(&task_id) {
            Some(h) => h,
            None => return false,
        };
        if handle.running {
            return false;
        }
        if handle.task.lock().await.state.is_terminal() {
            return false;
        }

        let pause = CancellationToken::new();
        handle.pause = Some(pause.clone());
        handle.running = true;

        let uploader = Uploader::new(
            task_id,
            handle.task.clone(),
            self.remote.clone(),
            self.source.clone(),
            handle.limiter.clone(),
            handle.bytes_uploaded.clone(),
            handle.cancel.clone(),
            pause,
            self.task_events.clone(),
            self.enable_rapid_upload,
        );
        tokio::spawn(uploader.run());

        debug!("池启动任务 #{}", task_id);
        true
    }

    /// 自动启动开启时，按入队顺序补满空闲槽位（须持有池锁）
    async fn fill_slots_locked(&self, state: &mut PoolState) {
        let ids: Vec<u64> = state.tasks.keys().copied().collect();
        for id in ids {
            if state.running_count() >= state.pool_size {
                break;
            }
            // 只拉起等待中的任务，暂停任务等用户显式恢复
            let startable = match state.tasks.get(&id) {
                Some(h) if !h.running => {
                    let t = h.task.lock().await;
                    t.state == crate::uploader::task::TaskState::Init
                }
                _ => false,
            };
            if startable {
                self.start_locked(state, id).await;
            }
        }
    }

    /// 事件泵：转发任务事件并处理终结递补
    async fn drain_loop(shared: Weak<PoolShared>, mut rx: mpsc::UnboundedReceiver<UploadEvent>) {
        while let Some(event) = rx.recv().await {
            let shared = match shared.upgrade() {
                Some(s) => s,
                None => break,
            };

            // 先更新池状态再对外广播，订阅者看到事件时 {运行, 等待} 划分已一致
            let task_id = event.task_id();
            match &event {
                UploadEvent::Paused { .. } => {
                    let mut state = shared.state.lock().await;
                    if let Some(handle) = state.tasks.get_mut(&task_id) {
                        handle.running = false;
                        handle.pause = None;
                    }
                    state.reapportion();
                }
                ev if ev.is_terminal() => {
                    let mut state = shared.state.lock().await;

                    // 自动递补：完成任务移除前，先启动第 pool_size 位（0 起）的任务
                    if state.auto_start && state.tasks.len() > state.pool_size {
                        if let Some(promote_id) =
                            state.tasks.keys().nth(state.pool_size).copied()
                        {
                            shared.start_locked(&mut state, promote_id).await;
                        }
                    }

                    state.tasks.remove(&task_id);
                    state.reapportion();
                    info!(
                        "任务 #{} 终结并移出池，剩余 {} 个",
                        task_id,
                        state.tasks.len()
                    );
                }
                _ => {}
            }

            // 订阅者异常（掉队、退出）不影响池：发送失败直接丢弃
            let _ = shared.events_tx.send(event);
        }
    }
}

/// 上传池
///
/// 独占持有全部 UploadTask；每个任务独占自己的文件句柄与在途请求
pub struct UploaderPool {
    shared: Arc<PoolShared>,
}

impl UploaderPool {
    /// 创建上传池
    ///
    /// # 参数
    /// * `remote` - 远端存储实现
    /// * `source` - 源过滤器（加密上传时注入加密过滤器）
    /// * `config` - 上传配置
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        source: Arc<dyn SourceFilter>,
        config: UploadConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (task_events, task_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                tasks: BTreeMap::new(),
                next_task_id: 1,
                auto_start: false,
                pool_size: config.pool_size,
                total_speed_limit: config.total_speed_limit_bps,
                disposed: false,
            }),
            remote,
            source,
            events_tx,
            task_events,
            enable_rapid_upload: config.enable_rapid_upload,
            on_duplicate: config.on_duplicate,
            max_threads_per_task: AtomicUsize::new(config.max_threads_per_task),
        });

        tokio::spawn(PoolShared::drain_loop(Arc::downgrade(&shared), task_rx));

        info!(
            "上传池就绪: pool_size={}, 限速={} B/s",
            config.pool_size, config.total_speed_limit_bps
        );
        Ok(Self { shared })
    }

    /// 订阅池事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.shared.events_tx.subscribe()
    }

    /// 入队一个上传任务，返回任务ID
    ///
    /// 自动启动开启且有空闲槽位时立即启动
    pub async fn queue_task(&self, file: TrackedFile, remote_path: String) -> Result<u64> {
        let mut state = self.shared.state.lock().await;
        self.ensure_alive(&state)?;

        let task_id = state.next_task_id;
        state.next_task_id += 1;

        let task = UploadTask::new(task_id, &file, remote_path.clone(), self.shared.on_duplicate);
        state.tasks.insert(
            task_id,
            TaskHandle {
                task: Arc::new(Mutex::new(task)),
                cancel: CancellationToken::new(),
                pause: None,
                limiter: Arc::new(SpeedLimiter::unlimited()),
                bytes_uploaded: Arc::new(AtomicU64::new(0)),
                running: false,
            },
        );

        info!(
            "任务入队: id={}, local={:?}, remote={}",
            task_id, file.local_path, remote_path
        );

        if state.auto_start && state.running_count() < state.pool_size {
            self.shared.start_locked(&mut state, task_id).await;
        }
        state.reapportion();

        Ok(task_id)
    }

    /// 开启自动启动并按入队顺序启动至多 pool_size 个任务
    pub async fn start_all(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        self.ensure_alive(&state)?;

        state.auto_start = true;
        let ids: Vec<u64> = state.tasks.keys().copied().collect();
        for id in ids {
            if state.running_count() >= state.pool_size {
                break;
            }
            self.shared.start_locked(&mut state, id).await;
        }
        state.reapportion();
        Ok(())
    }

    /// 启动指定任务
    ///
    /// 显式指名启动视为用户意图，允许超出 pool_size
    pub async fn start(&self, task_id: u64) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        self.ensure_alive(&state)?;

        if !state.tasks.contains_key(&task_id) {
            anyhow::bail!("任务不存在: {}", task_id);
        }
        self.shared.start_locked(&mut state, task_id).await;
        state.reapportion();
        Ok(())
    }

    /// 暂停全部任务并关闭自动启动
    pub async fn pause_all(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        self.ensure_alive(&state)?;

        state.auto_start = false;
        let ids: Vec<u64> = state.tasks.keys().copied().collect();
        for id in ids {
            self.pause_locked(&mut state, id).await;
        }
        Ok(())
    }

    /// 暂停指定任务
    pub async fn pause(&self, task_id: u64) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        self.ensure_alive(&state)?;

        if !state.tasks.contains_key(&task_id) {
            anyhow::bail!("任务不存在: {}", task_id);
        }
        self.pause_locked(&mut state, task_id).await;
        Ok(())
    }

    async fn pause_locked(&self, state: &mut PoolState, task_id: u64) {
        let handle = match state.tasks.get_mut(&task_id) {
            Some(h) => h,
            None => return,
        };

        if handle.running {
            // 工作器在阶段边界或在途请求处观察到令牌，自行落到 Paused
            if let Some(pause) = &handle.pause {
                pause.cancel();
            }
            return;
        }

        // 未运行的等待任务由池直接置为暂停
        let mut task = handle.task.lock().await;
        if task.state.is_terminal() || task.state == crate::uploader::task::TaskState::Paused {
            return;
        }
        task.mark_paused();
        drop(task);
        let _ = self.shared.task_events.send(UploadEvent::Paused { task_id });
    }

    /// 取消全部任务并清空队列
    pub async fn cancel_all(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        self.ensure_alive(&state)?;

        let ids: Vec<u64> = state.tasks.keys().copied().collect();
        for id in ids {
            self.cancel_locked(&mut state, id).await;
        }
        Ok(())
    }

    /// 取消指定任务并移除
    ///
    /// 对终态或已移除的任务幂等：不产生新事件，直接返回成功
    pub async fn cancel(&self, task_id: u64) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        self.ensure_alive(&state)?;
        self.cancel_locked(&mut state, task_id).await;
        Ok(())
    }

    async fn cancel_locked(&self, state: &mut PoolState, task_id: u64) {
        let handle = match state.tasks.get_mut(&task_id) {
            Some(h) => h,
            None => return, // 已移除，幂等
        };

        if handle.task.lock().await.state.is_terminal() {
            return; // 终态幂等
        }

        handle.cancel.cancel();

        if !handle.running {
            // 没有工作器代为终结，由池直接取消；事件泵负责移除与递补
            let mut task = handle.task.lock().await;
            task.mark_cancelled(None);
            drop(task);
            let _ = self.shared.task_events.send(UploadEvent::Cancelled {
                task_id,
                error: None,
            });
        }
        info!("取消任务 #{}", task_id);
    }

    /// 调整全局限速，0 表示不限速
    pub async fn set_speed_limit(&self, total_bps: u64) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        self.ensure_alive(&state)?;
        state.total_speed_limit = total_bps;
        state.reapportion();
        info!("全局限速调整为 {} B/s", total_bps);
        Ok(())
    }

    /// 调整最大并发任务数
    pub async fn set_pool_size(&self, pool_size: usize) -> Result<()> {
        if pool_size == 0 {
            anyhow::bail!("pool_size 必须大于 0");
        }
        let mut state = self.shared.state.lock().await;
        self.ensure_alive(&state)?;

        state.pool_size = pool_size;
        if state.auto_start {
            self.shared.fill_slots_locked(&mut state).await;
        }
        state.reapportion();
        Ok(())
    }

    /// 调整单任务最大传输线程数（由传输层实现消费）
    pub async fn set_max_threads_per_task(&self, n: usize) -> Result<()> {
        if n == 0 {
            anyhow::bail!("max_threads_per_task 必须大于等于 1");
        }
        let state = self.shared.state.lock().await;
        self.ensure_alive(&state)?;
        self.shared.max_threads_per_task.store(n, Ordering::SeqCst);
        Ok(())
    }

    /// 当前单任务最大传输线程数
    pub fn max_threads_per_task(&self) -> usize {
        self.shared.max_threads_per_task.load(Ordering::SeqCst)
    }

    /// 销毁池：取消并释放全部任务，之后任何控制操作都会报错
    pub async fn dispose(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.disposed {
            return Ok(());
        }
        state.disposed = true;
        state.auto_start = false;

        let ids: Vec<u64> = state.tasks.keys().copied().collect();
        for id in ids {
            if let Some(handle) = state.tasks.get(&id) {
                handle.cancel.cancel();
                if !handle.running {
                    let mut task = handle.task.lock().await;
                    if !task.state.is_terminal() {
                        task.mark_cancelled(None);
                        drop(task);
                        let _ = self.shared.task_events.send(UploadEvent::Cancelled {
                            task_id: id,
                            error: None,
                        });
                    }
                }
            }
        }
        state.tasks.clear();

        warn!("上传池已销毁");
        Ok(())
    }

    /// 任务快照
    pub async fn task(&self, task_id: u64) -> Option<UploadTask> {
        let state = self.shared.state.lock().await;
        let handle = state.tasks.get(&task_id)?;
        let result = handle.task.lock().await.clone();
        Some(result)
    }

    /// 全部任务快照（按入队顺序）
    pub async fn tasks(&self) -> Vec<UploadTask> {
        let state = self.shared.state.lock().await;
        let mut tasks = Vec::with_capacity(state.tasks.len());
        for handle in state.tasks.values() {
            tasks.push(handle.task.lock().await.clone());
        }
        tasks
    }

    /// 池中任务数
    pub async fn task_count(&self) -> usize {
        self.shared.state.lock().await.tasks.len()
    }

    /// 正在运行的任务数
    pub async fn running_count(&self) -> usize {
        self.shared.state.lock().await.running_count()
    }

    fn ensure_alive(&self, state: &PoolState) -> Result<()> {
        if state.disposed {
            anyhow::bail!("上传池已销毁");
        }
        Ok(())
    }
}
