//! 播放统计模块
//!
//! 两类数据：
//! - 每秒水位：最少/最多填充块数，由时钟反馈消费后重置
//! - 累计计数：回调次数、欠载、溢出、速度微调次数
//!
//! 所有操作都是 lock-free 的，生产者和音频回调都可以直接调用

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// 播放统计收集器
pub struct PlaybackStats {
    /// 本秒内最少填充块数；`buffers + 1` 表示本秒还没有测量
    min_filled: AtomicU32,
    /// 本秒内最多填充块数
    max_filled: AtomicU32,
    /// 哨兵值（buffers + 1）
    unmeasured: u32,

    callback_count: AtomicU64,
    underrun_count: AtomicU64,
    samples_played: AtomicU64,
    speed_up_count: AtomicU64,
    slow_down_count: AtomicU64,
}

impl PlaybackStats {
    pub fn new(buffers: u32) -> Self {
        Self {
            min_filled: AtomicU32::new(buffers + 1),
            max_filled: AtomicU32::new(0),
            unmeasured: buffers + 1,
            callback_count: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
            samples_played: AtomicU64::new(0),
            speed_up_count: AtomicU64::new(0),
            slow_down_count: AtomicU64::new(0),
        }
    }

    /// 在 render callback 内调用
    #[inline]
    pub fn on_callback(&self) {
        self.callback_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次水位观测（块数）
    #[inline]
    pub fn observe_filled(&self, filled_blocks: u32) {
        self.min_filled.fetch_min(filled_blocks, Ordering::Relaxed);
        self.max_filled.fetch_max(filled_blocks, Ordering::Relaxed);
    }

    /// 只更新最大水位（生产者发布新块、回调入口）
    #[inline]
    pub fn observe_max(&self, filled_blocks: u32) {
        self.max_filled.fetch_max(filled_blocks, Ordering::Relaxed);
    }

    /// 记录 underrun
    ///
    /// 本秒最少水位直接记为 0
    #[inline]
    pub fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
        self.min_filled.store(0, Ordering::Relaxed);
    }

    /// 预缓冲未完成：本秒最少水位记为 0，但不算欠载
    #[inline]
    pub fn record_priming(&self) {
        self.min_filled.store(0, Ordering::Relaxed);
    }

    /// 更新已播放样本数
    #[inline]
    pub fn add_samples_played(&self, samples: u64) {
        self.samples_played.fetch_add(samples, Ordering::Relaxed);
    }

    /// 记录一次速度微调
    #[inline]
    pub fn record_nudge(&self, speed_up: bool) {
        if speed_up {
            self.speed_up_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.slow_down_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 取出本秒水位并重置
    ///
    /// 本秒没有任何测量时返回 None
    pub fn take_second(&self) -> Option<FillWindow> {
        let min = self.min_filled.swap(self.unmeasured, Ordering::Relaxed);
        let max = self.max_filled.swap(0, Ordering::Relaxed);
        if min >= self.unmeasured {
            None
        } else {
            Some(FillWindow { min, max })
        }
    }

    /// 获取 underrun 计数
    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// 获取 callback 计数
    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    /// 获取已播放样本数
    #[inline]
    pub fn samples_played(&self) -> u64 {
        self.samples_played.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, overflow_count: u64, ticks: u64) -> StatsReport {
        StatsReport {
            callback_count: self.callback_count(),
            underrun_count: self.underrun_count(),
            overflow_count,
            samples_played: self.samples_played(),
            speed_up_count: self.speed_up_count.load(Ordering::Relaxed),
            slow_down_count: self.slow_down_count.load(Ordering::Relaxed),
            ticks,
        }
    }

    /// 重置本秒水位
    pub fn reset_window(&self) {
        self.min_filled.store(self.unmeasured, Ordering::Relaxed);
        self.max_filled.store(0, Ordering::Relaxed);
    }
}

/// 一秒内的水位区间（块数）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillWindow {
    pub min: u32,
    pub max: u32,
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub callback_count: u64,
    pub underrun_count: u64,
    pub overflow_count: u64,
    pub samples_played: u64,
    pub speed_up_count: u64,
    pub slow_down_count: u64,
    pub ticks: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Sound Sync Statistics")?;
        writeln!(f, "=====================")?;
        writeln!(f, "Emulated ticks: {}", self.ticks)?;
        writeln!(f, "Total callbacks: {}", self.callback_count)?;
        writeln!(f, "Samples played: {}", self.samples_played)?;
        writeln!(f)?;

        writeln!(f, "Buffer Events:")?;
        writeln!(f, "  Underruns: {}", self.underrun_count)?;
        writeln!(f, "  Overflows (blocks dropped): {}", self.overflow_count)?;
        writeln!(f)?;

        writeln!(f, "Clock Feedback:")?;
        writeln!(f, "  Speed up: {}", self.speed_up_count)?;
        writeln!(f, "  Slow down: {}", self.slow_down_count)?;

        Ok(())
    }
}
