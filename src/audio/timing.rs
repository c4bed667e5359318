//! 墙钟毫秒计数
//!
//! 漂移补偿时钟只需要一个自由运行、允许回绕的 u32 毫秒计数器。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// 进程启动时刻（全局缓存，只初始化一次）
static APP_START: OnceLock<Instant> = OnceLock::new();

/// 自启动以来的毫秒数（u32 回绕，约 49.7 天一圈）
#[inline]
pub fn now_ms() -> u32 {
    let start = APP_START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u32
}

/// 毫秒时间源
pub trait WallClock {
    fn now_ms(&self) -> u32;
}

/// 单调时钟（基于 `Instant`）
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl WallClock for MonotonicClock {
    #[inline]
    fn now_ms(&self) -> u32 {
        now_ms()
    }
}

/// 手动推进的时钟（测试和确定性模拟）
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU32,
}

impl ManualClock {
    pub fn new(ms: u32) -> Self {
        Self {
            ms: AtomicU32::new(ms),
        }
    }

    pub fn set(&self, ms: u32) {
        self.ms.store(ms, Ordering::Relaxed);
    }

    /// 前进 `delta` 毫秒（回绕）
    pub fn advance(&self, delta: u32) {
        self.ms.fetch_add(delta, Ordering::Relaxed);
    }
}

impl WallClock for ManualClock {
    #[inline]
    fn now_ms(&self) -> u32 {
        self.ms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now() {
        let t1 = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let t2 = now_ms();

        let diff = t2.wrapping_sub(t1);
        assert!(diff >= 15, "expected at least 15ms, got {}ms", diff);
    }

    #[test]
    fn test_manual_clock_wraps() {
        let clock = ManualClock::new(u32::MAX - 1);
        clock.advance(3);
        assert_eq!(clock.now_ms(), 1);
        clock.set(500);
        assert_eq!(clock.now_ms(), 500);
    }
}
