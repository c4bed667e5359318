//! 漂移补偿时钟
//!
//! 把自由运行的墙钟毫秒计数映射为固定频率的逻辑 tick。
//! 下一个 tick 的截止时间用 16 位小数的定点数累加，长期运行不漂移；
//! 运行时路径只有整数运算。
//!
//! - 小抖动：追赶，一次调用可能产生 0、1 或多个 tick
//! - 大停顿（宿主挂起等）：只前进一个 tick，并以当前时间重新对齐
//! - 时钟回拨：重新对齐，不前进

mod pacer;

pub use pacer::{TickPacer, TickUpdate};

use crate::error::{check_range, ConfigError};

/// 定点小数位数
pub const FRAC_BITS: u32 = 16;
const FRAC_MASK: u32 = (1 << FRAC_BITS) - 1;

/// 时钟配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockConfig {
    /// 每个 tick 的毫秒数（16 位小数定点）
    pub step: u32,
    /// 超过这个毫秒数的偏差视为停顿或回拨
    pub stall_threshold_ms: u32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            // 1000 / 60.14742 Hz × 65536
            step: 1_089_590,
            stall_threshold_ms: 256,
        }
    }
}

impl ClockConfig {
    /// 按目标频率计算步长（只在配置时用浮点）
    pub fn from_frequency(hz: f64) -> Self {
        let step = (1000.0 * (1u64 << FRAC_BITS) as f64 / hz).round();
        Self {
            step: step.clamp(1.0, u32::MAX as f64) as u32,
            ..Self::default()
        }
    }

    /// 目标频率（Hz）
    pub fn frequency(&self) -> f64 {
        1000.0 * (1u64 << FRAC_BITS) as f64 / self.step as f64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // 小数部分累加不能溢出 u32
        check_range("clock step", self.step as u64, 1, 1 << 28)?;
        check_range(
            "stall_threshold_ms",
            self.stall_threshold_ms as u64,
            1,
            i32::MAX as u64 / 2,
        )
    }
}

/// 每秒反馈的方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nudge {
    /// 多给一个 tick：模拟相对音频加速（缓冲区太空）
    SpeedUp,
    /// 下一个截止时间推迟一步：模拟减速（缓冲区太满）
    SlowDown,
}

/// 漂移补偿时钟
#[derive(Debug, Clone)]
pub struct DriftClock {
    true_emulated_time: u64,
    next_int_time: u32,
    next_frac_time: u32,
    last_time: u32,
    step: u32,
    stall_threshold: i32,
    /// `last_time / 1000`
    current_second: u32,
    second_elapsed: bool,
}

impl DriftClock {
    /// 以当前墙钟时间初始化
    pub fn new(config: ClockConfig, wall_ms: u32) -> Self {
        let mut clock = Self {
            true_emulated_time: 0,
            next_int_time: wall_ms,
            next_frac_time: 0,
            last_time: wall_ms,
            step: config.step,
            stall_threshold: config.stall_threshold_ms.min(i32::MAX as u32) as i32,
            current_second: wall_ms / 1000,
            second_elapsed: false,
        };
        clock.init_next_time();
        clock
    }

    #[inline]
    fn incr_next_time(&mut self) {
        self.next_frac_time += self.step;
        self.next_int_time = self
            .next_int_time
            .wrapping_add(self.next_frac_time >> FRAC_BITS);
        self.next_frac_time &= FRAC_MASK;
    }

    fn init_next_time(&mut self) {
        self.next_int_time = self.last_time;
        self.next_frac_time = 0;
        self.incr_next_time();
    }

    /// 以 `wall_ms` 重新对齐（从暂停恢复时）
    pub fn resync(&mut self, wall_ms: u32) {
        self.last_time = wall_ms;
        self.init_next_time();
    }

    /// 推进到 `wall_ms`，返回新产生的 tick 数
    pub fn advance(&mut self, wall_ms: u32) -> u32 {
        if wall_ms == self.last_time {
            return 0;
        }

        self.last_time = wall_ms;
        let second = wall_ms / 1000;
        if second != self.current_second {
            self.current_second = second;
            self.second_elapsed = true;
        }

        // 回绕安全
        let mut diff = wall_ms.wrapping_sub(self.next_int_time) as i32;

        if diff >= 0 {
            if diff > self.stall_threshold {
                self.true_emulated_time += 1;
                self.init_next_time();
                log::debug!(
                    "Emulation interrupted ({}ms behind), tick {}",
                    diff,
                    self.true_emulated_time
                );
                return 1;
            }

            let mut ticks = 0;
            while diff >= 0 {
                self.true_emulated_time += 1;
                ticks += 1;
                self.incr_next_time();
                diff = wall_ms.wrapping_sub(self.next_int_time) as i32;
            }
            ticks
        } else {
            if diff < -self.stall_threshold {
                log::warn!("Clock set back by {}ms, resetting", -(diff as i64));
                self.init_next_time();
            }
            0
        }
    }

    /// 每秒反馈
    pub fn nudge(&mut self, nudge: Nudge) {
        match nudge {
            Nudge::SpeedUp => self.true_emulated_time += 1,
            Nudge::SlowDown => self.incr_next_time(),
        }
    }

    /// 墙钟秒数变化过一次后返回 true（只报告一次）
    pub fn take_second_elapsed(&mut self) -> bool {
        std::mem::take(&mut self.second_elapsed)
    }

    /// 距下一个 tick 截止时间的毫秒数（已到期为 0）
    #[inline]
    pub fn ms_until_next_tick(&self) -> u32 {
        let diff = self.next_int_time.wrapping_sub(self.last_time) as i32;
        diff.max(0) as u32
    }

    #[inline]
    pub fn true_time(&self) -> u64 {
        self.true_emulated_time
    }

    #[inline]
    pub fn last_time(&self) -> u32 {
        self.last_time
    }

    /// 下一个 tick 的截止时间（墙钟毫秒）
    #[inline]
    pub fn next_deadline(&self) -> u32 {
        self.next_int_time
    }
}
