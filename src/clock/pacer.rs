//! 主循环节拍
//!
//! 模拟循环每跑完一个 tick 调用 `wait_for_next_tick`：
//! 没有新 tick 就睡到下一个截止时间，有了就告诉调用方要模拟几个 tick，
//! 以及是否跨过了一个墙钟秒（触发每秒的缓冲区反馈）。

use super::DriftClock;
use crate::audio::timing::WallClock;

/// 一次等待的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickUpdate {
    /// 自上次以来新增的 tick 数（至少 1）
    pub ticks: u64,
    /// 期间是否跨过了墙钟秒
    pub second_elapsed: bool,
}

/// 主循环节拍器
#[derive(Debug, Clone)]
pub struct TickPacer {
    /// 主循环已经处理到的 tick
    on_true_time: u64,
}

impl TickPacer {
    pub fn new(clock: &DriftClock) -> Self {
        Self {
            on_true_time: clock.true_time(),
        }
    }

    /// 推进时钟；还没有新 tick 时返回 true
    pub fn extra_time_not_over<W: WallClock + ?Sized>(
        &self,
        clock: &mut DriftClock,
        wall: &W,
    ) -> bool {
        clock.advance(wall.now_ms());
        clock.true_time() == self.on_true_time
    }

    /// 等到至少一个新 tick
    ///
    /// `delay` 负责睡眠给定的毫秒数（生产环境是 `thread::sleep`，
    /// 测试里可以直接推进手动时钟）。
    pub fn wait_for_next_tick<W, D>(
        &mut self,
        clock: &mut DriftClock,
        wall: &W,
        mut delay: D,
    ) -> TickUpdate
    where
        W: WallClock + ?Sized,
        D: FnMut(u32),
    {
        while self.extra_time_not_over(clock, wall) {
            delay(clock.ms_until_next_tick().max(1));
        }

        let ticks = clock.true_time() - self.on_true_time;
        self.on_true_time = clock.true_time();

        TickUpdate {
            ticks,
            second_elapsed: clock.take_second_elapsed(),
        }
    }

    /// 跳过积压的 tick（从暂停恢复时）
    pub fn catch_up(&mut self, clock: &DriftClock) {
        self.on_true_time = clock.true_time();
    }

    #[inline]
    pub fn on_true_time(&self) -> u64 {
        self.on_true_time
    }
}
