// 上传限速器
//
// 令牌桶：速率可在运行期由上传池重新分配，0 表示不限速。
// 桶容量为一秒配额（下限 256KB），允许短暂突发后回落到平均速率

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// 突发额度下限（字节）
const MIN_BURST_BYTES: f64 = 256.0 * 1024.0;

#[derive(Debug)]
struct BucketState {
    /// 当前令牌数（字节），欠账时为负
    tokens: f64,
    /// 上次补充时间
    last_refill: Instant,
}

/// 限速器
///
/// `throttle(bytes)` 在配额不足时挂起调用方，直到欠账还清
#[derive(Debug)]
pub struct SpeedLimiter {
    /// 速率 (bytes/s)，0 = 不限速
    rate_bps: AtomicU64,
    state: Mutex<BucketState>,
}

impl SpeedLimiter {
    /// 创建限速器
    pub fn new(rate_bps: u64) -> Self {
        Self {
            rate_bps: AtomicU64::new(rate_bps),
            state: Mutex::new(BucketState {
                tokens: burst_capacity(rate_bps),
                last_refill: Instant::now(),
            }),
        }
    }

    /// 创建不限速的限速器
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// 当前速率 (bytes/s)，0 = 不限速
    pub fn rate(&self) -> u64 {
        self.rate_bps.load(Ordering::SeqCst)
    }

    /// 调整速率（上传池重新分配带宽时调用）
    pub fn set_rate(&self, rate_bps: u64) {
        self.rate_bps.store(rate_bps, Ordering::SeqCst);
    }

    /// 消耗 `bytes` 字节配额，不足时等待
    pub async fn throttle(&self, bytes: u64) {
        let rate = self.rate();
        if rate == 0 || bytes == 0 {
            return;
        }
        let rate = rate as f64;
        let burst = burst_capacity(self.rate());

        let wait = {
            let mut state = self.state.lock().await;

            // 按流逝时间补充令牌，封顶突发额度
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.last_refill = now;
            state.tokens = (state.tokens + elapsed * rate).min(burst);

            // 直接扣减，欠账转为等待时长
            state.tokens -= bytes as f64;
            if state.tokens < 0.0 {
                Duration::from_secs_f64(-state.tokens / rate)
            } else {
                Duration::ZERO
            }
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

fn burst_capacity(rate_bps: u64) -> f64 {
    (rate_bps as f64).max(MIN_BURST_BYTES)
}
