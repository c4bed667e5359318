//! 播放过渡引擎
//!
//! 在输出后端的拉取回调里运行的小状态机：
//!
//! ```text
//! Stopped → Starting → Playing → Stopping → Stopped
//! ```
//!
//! 所有电平跳变（开始、停止、欠载恢复）都走斜坡，避免爆音。
//! 欠载时重复最后一个电平而不是输出静音。
//!
//! **回调内绝对禁止：** 锁、分配、I/O

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::atomic::AtomicCell;

use super::format::{PcmSample, CENTER_LEVEL};
use super::ring_buffer::SampleReader;
use super::stats::PlaybackStats;
use crate::error::{check_range, ConfigError};

/// 播放阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackPhase {
    Stopped,
    /// 等待预缓冲，然后从当前电平斜坡到第一个样本
    Starting,
    Playing,
    /// 斜坡回到中心电平
    Stopping,
}

/// 过渡引擎配置
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// 开始播放前需要的已填充块数
    pub prime_buffers: u32,
    /// 期望的每秒最少填充块数（时钟反馈目标）
    pub desired_min_filled: u32,
    /// 斜坡每个输出样本的最大电平变化
    pub ramp_step: u16,
    /// 停止时等待斜坡完成的最大轮询次数
    pub stop_retry_limit: u32,
    /// 每次轮询之间的等待
    pub stop_retry_delay: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            prime_buffers: 8,
            // 太大声音滞后于模拟，太小会断音
            desired_min_filled: 4,
            ramp_step: 0x0040,
            // 50 × 10ms = 半秒
            stop_retry_limit: 50,
            stop_retry_delay: Duration::from_millis(10),
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self, buffers: u32) -> Result<(), ConfigError> {
        check_range("prime_buffers", self.prime_buffers as u64, 0, buffers as u64)?;
        check_range(
            "desired_min_filled",
            self.desired_min_filled as u64,
            0,
            buffers as u64,
        )?;
        check_range("ramp_step", self.ramp_step as u64, 1, u16::MAX as u64)?;
        check_range("stop_retry_limit", self.stop_retry_limit as u64, 1, u32::MAX as u64)
    }
}

/// 生产者与回调之间共享的播放控制
///
/// - `want_playing`: 只由生产者写
/// - `phase` / `last_level`: 只由回调写，生产者读来判断停止斜坡是否完成
pub struct PlaybackControl {
    want_playing: AtomicBool,
    phase: AtomicCell<PlaybackPhase>,
    last_level: AtomicU16,
}

impl PlaybackControl {
    pub fn new() -> Self {
        Self {
            want_playing: AtomicBool::new(false),
            phase: AtomicCell::new(PlaybackPhase::Stopped),
            last_level: AtomicU16::new(CENTER_LEVEL),
        }
    }

    /// 请求开始播放（生产者调用）
    #[inline]
    pub fn request_start(&self) {
        self.want_playing.store(true, Ordering::Release);
    }

    /// 请求停止播放（生产者调用）
    #[inline]
    pub fn request_stop(&self) {
        self.want_playing.store(false, Ordering::Release);
    }

    #[inline]
    pub fn wants_playing(&self) -> bool {
        self.want_playing.load(Ordering::Acquire)
    }

    /// 回调最近一次发布的阶段
    #[inline]
    pub fn phase(&self) -> PlaybackPhase {
        self.phase.load()
    }

    /// 回调最近一次输出的电平
    #[inline]
    pub fn last_level(&self) -> u16 {
        self.last_level.load(Ordering::Acquire)
    }
}

impl Default for PlaybackControl {
    fn default() -> Self {
        Self::new()
    }
}

/// 从 `level` 向 `target` 斜坡，每个样本最多变化 `step`
///
/// 写入 `out` 并返回写入的样本数；电平到达目标或 `out` 写满时停止。
/// 从 V0 到 V1 恰好需要 `ceil(|V1 - V0| / step)` 个样本，且单调。
pub fn ramp_to<T: PcmSample>(level: &mut u16, target: u16, step: u16, out: &mut [T]) -> usize {
    let mut n = 0;
    let mut v = *level;

    while v != target && n < out.len() {
        v = if v > target {
            if v - target > step {
                v - step
            } else {
                target
            }
        } else if target - v > step {
            v + step
        } else {
            target
        };

        out[n] = T::from_level(v);
        n += 1;
    }

    *level = v;
    n
}

/// 过渡引擎（输出回调持有）
pub struct Renderer<T: PcmSample> {
    reader: SampleReader<T>,
    control: Arc<PlaybackControl>,
    stats: Arc<PlaybackStats>,
    prime_buffers: u32,
    ramp_step: u16,
    block_len: u32,
    phase: PlaybackPhase,
    level: u16,
}

impl<T: PcmSample> Renderer<T> {
    pub fn new(
        reader: SampleReader<T>,
        control: Arc<PlaybackControl>,
        stats: Arc<PlaybackStats>,
        config: &PlaybackConfig,
    ) -> Self {
        let block_len = reader.buffer().block_len();
        let phase = control.phase();
        let level = control.last_level();
        Self {
            reader,
            control,
            stats,
            prime_buffers: config.prime_buffers,
            ramp_step: config.ramp_step,
            block_len,
            phase,
            level,
        }
    }

    #[inline]
    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    /// 最后输出的电平
    #[inline]
    pub fn level(&self) -> u16 {
        self.level
    }

    /// 拉取回调：填满 `out`
    pub fn render(&mut self, out: &mut [T]) {
        self.stats.on_callback();

        let want_playing = self.control.wants_playing();
        let next = match (self.phase, want_playing) {
            (PlaybackPhase::Stopped | PlaybackPhase::Stopping, true) => PlaybackPhase::Starting,
            (PlaybackPhase::Starting | PlaybackPhase::Playing, false) => PlaybackPhase::Stopping,
            (phase, _) => phase,
        };
        if next != self.phase {
            log::trace!("Playback phase {:?} -> {:?}", self.phase, next);
            self.phase = next;
        }

        self.stats.observe_max(self.reader.available() / self.block_len);

        let mut pos = 0;
        loop {
            let available = self.reader.available();
            let filled = available / self.block_len;

            let playable = match self.phase {
                PlaybackPhase::Stopped => 0,
                PlaybackPhase::Stopping => {
                    pos += ramp_to(&mut self.level, CENTER_LEVEL, self.ramp_step, &mut out[pos..]);
                    if self.level == CENTER_LEVEL {
                        log::trace!("Playback phase Stopping -> Stopped");
                        self.phase = PlaybackPhase::Stopped;
                    }
                    0
                }
                PlaybackPhase::Starting => match self.reader.peek() {
                    Some(first) if filled >= self.prime_buffers => {
                        let target = first.to_level();
                        pos += ramp_to(&mut self.level, target, self.ramp_step, &mut out[pos..]);
                        if self.level == target {
                            log::trace!("Playback phase Starting -> Playing");
                            self.phase = PlaybackPhase::Playing;
                        }
                        available
                    }
                    _ => {
                        // 预缓冲中：停在中心电平（停止斜坡被打断时先斜坡回中心）
                        pos += ramp_to(&mut self.level, CENTER_LEVEL, self.ramp_step, &mut out[pos..]);
                        self.stats.record_priming();
                        0
                    }
                },
                PlaybackPhase::Playing => available,
            };

            let rest = &mut out[pos..];

            if rest.is_empty() {
                if matches!(self.phase, PlaybackPhase::Playing | PlaybackPhase::Starting) {
                    self.stats.observe_filled(filled);
                }
                break;
            }

            if playable == 0 || self.phase != PlaybackPhase::Playing {
                // 欠载、预缓冲中或已停止：保持最后电平
                rest.fill(T::from_level(self.level));
                match self.phase {
                    PlaybackPhase::Playing => {
                        log::trace!("Under run, padding {} samples", rest.len());
                        self.stats.record_underrun();
                    }
                    PlaybackPhase::Starting => self.stats.record_priming(),
                    _ => {}
                }
                break;
            }

            let n = self.reader.consume(rest);
            self.level = rest[n - 1].to_level();
            self.stats.add_samples_played(n as u64);
            pos += n;
        }

        self.control.last_level.store(self.level, Ordering::Release);
        self.control.phase.store(self.phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ring_buffer::{BufferConfig, SampleBuffer, SampleWriter};

    fn renderer_i16(
        buffers: u32,
        block_len: u32,
        config: PlaybackConfig,
    ) -> (SampleWriter<i16>, Renderer<i16>, Arc<PlaybackControl>, Arc<PlaybackStats>) {
        let (writer, reader) = SampleBuffer::<i16>::new(BufferConfig { buffers, block_len })
            .unwrap()
            .split();
        let control = Arc::new(PlaybackControl::new());
        let stats = Arc::new(PlaybackStats::new(buffers));
        let renderer = Renderer::new(reader, Arc::clone(&control), Arc::clone(&stats), &config);
        (writer, renderer, control, stats)
    }

    /// 原生有符号值 → 生产者写入的无符号偏置值
    fn biased(v: i16) -> i16 {
        ((v as u16) ^ CENTER_LEVEL) as i16
    }

    #[test]
    fn test_ramp_length_and_monotonic() {
        for (v0, v1, step) in [
            (0x8000u16, 0x8000u16, 0x40u16),
            (0x8000, 0x8041, 0x40),
            (0x8000, 0x8080, 0x40),
            (0x0000, 0xFFFF, 0x40),
            (0xFFFF, 0x0001, 0x100),
            (0x1234, 0x1200, 0x7),
        ] {
            let mut out = vec![0i16; 4096];
            let mut level = v0;
            let n = ramp_to(&mut level, v1, step, &mut out);

            let diff = (v1 as i32 - v0 as i32).unsigned_abs();
            let expected = diff.div_ceil(step as u32) as usize;
            assert_eq!(n, expected, "ramp {:#x} -> {:#x}", v0, v1);
            assert_eq!(level, v1);

            let levels: Vec<u16> = out[..n].iter().map(|s| s.to_level()).collect();
            if v1 >= v0 {
                assert!(levels.windows(2).all(|w| w[0] <= w[1]));
            } else {
                assert!(levels.windows(2).all(|w| w[0] >= w[1]));
            }
            if n > 0 {
                assert_eq!(levels[n - 1], v1);
            }
        }
    }

    #[test]
    fn test_ramp_stops_when_output_full() {
        let mut out = [0u8; 3];
        let mut level = 0x8000;
        assert_eq!(ramp_to(&mut level, 0x9000, 0x40, &mut out), 3);
        assert_eq!(level, 0x80C0);
    }

    #[test]
    fn test_starting_below_prime_emits_center() {
        let (mut writer, mut renderer, control, stats) =
            renderer_i16(16, 64, PlaybackConfig::default());
        control.request_start();

        // 7 块 < 8 块预缓冲
        writer.write_samples(&[biased(1000); 7 * 64]);

        let mut out = [123i16; 256];
        renderer.render(&mut out);

        assert_eq!(renderer.phase(), PlaybackPhase::Starting);
        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(renderer.reader.available(), 7 * 64);
        assert_eq!(stats.underrun_count(), 0);
        assert_eq!(stats.take_second().unwrap().min, 0);
    }

    #[test]
    fn test_start_ramps_then_plays() {
        let (mut writer, mut renderer, control, _stats) =
            renderer_i16(16, 64, PlaybackConfig::default());
        control.request_start();

        // 第一个样本 +0x100：斜坡 4 个样本
        let data: Vec<i16> = (0..8 * 64).map(|i| biased(0x100 + i as i16)).collect();
        writer.write_samples(&data);

        let mut out = [0i16; 16];
        renderer.render(&mut out);

        assert_eq!(&out[..4], &[0x40, 0x80, 0xC0, 0x100]);
        assert_eq!(renderer.phase(), PlaybackPhase::Playing);
        // 然后是缓冲区里的真实数据
        let expected: Vec<i16> = (0..12).map(|i| 0x100 + i).collect();
        assert_eq!(&out[4..], &expected[..]);
        assert_eq!(control.phase(), PlaybackPhase::Playing);
    }

    #[test]
    fn test_start_ramp_spans_callbacks() {
        let (mut writer, mut renderer, control, _stats) =
            renderer_i16(16, 64, PlaybackConfig::default());
        control.request_start();
        writer.write_samples(&[biased(0x400); 8 * 64]);

        // 需要 16 个样本的斜坡，每次只拉 10 个
        let mut out = [0i16; 10];
        renderer.render(&mut out);
        assert_eq!(renderer.phase(), PlaybackPhase::Starting);
        assert_eq!(out[9], 0x40 * 10);

        renderer.render(&mut out);
        assert_eq!(renderer.phase(), PlaybackPhase::Playing);
        assert_eq!(out[5], 0x400);
        assert!(out[6..].iter().all(|&s| s == 0x400));
        assert_eq!(renderer.reader.available(), 8 * 64 - 4);
    }

    #[test]
    fn test_underrun_repeats_last_value() {
        let (mut writer, mut renderer, control, stats) = renderer_i16(8, 512, PlaybackConfig::default());
        control.request_start();
        renderer.phase = PlaybackPhase::Playing;

        // 3 整块：1536 样本
        let data: Vec<i16> = (0..1536).map(|i| biased((i % 300) as i16 - 150)).collect();
        assert_eq!(writer.write_samples(&data), 1536);
        assert_eq!(renderer.reader.available(), 1536);

        let mut out = vec![0i16; 2000];
        renderer.render(&mut out);

        let expected: Vec<i16> = (0..1536).map(|i| (i % 300) as i16 - 150).collect();
        assert_eq!(&out[..1536], &expected[..]);
        let last = expected[1535];
        assert!(out[1536..].iter().all(|&s| s == last));
        assert_eq!(out.len() - 1536, 464);
        assert_eq!(renderer.reader.available(), 0);
        assert_eq!(renderer.phase(), PlaybackPhase::Playing);
        assert_eq!(stats.underrun_count(), 1);
        assert_eq!(stats.samples_played(), 1536);

        // 完全没有数据时：整块都是最后电平
        renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == last));
        assert_eq!(stats.underrun_count(), 2);
    }

    #[test]
    fn test_playing_wraps_ring_end() {
        let (mut writer, mut renderer, control, _stats) =
            renderer_i16(4, 4, PlaybackConfig {
                prime_buffers: 0,
                ..PlaybackConfig::default()
            });
        control.request_start();
        renderer.phase = PlaybackPhase::Playing;

        let mut out = [0i16; 12];
        writer.write_samples(&[biased(1); 12]);
        renderer.render(&mut out);

        // 跨越 16 样本环形末尾
        let data: Vec<i16> = (10..18).map(biased).collect();
        writer.write_samples(&data);
        let mut out = [0i16; 8];
        renderer.render(&mut out);
        assert_eq!(out, [10, 11, 12, 13, 14, 15, 16, 17]);
    }

    #[test]
    fn test_stop_ramps_to_center() {
        let (mut writer, mut renderer, control, stats) =
            renderer_i16(16, 64, PlaybackConfig::default());
        control.request_start();
        renderer.phase = PlaybackPhase::Playing;

        writer.write_samples(&[biased(0x200); 64]);
        let mut out = [0i16; 64];
        renderer.render(&mut out);
        assert_eq!(renderer.level(), 0x8200);

        control.request_stop();
        let mut out = [0i16; 4];
        renderer.render(&mut out);
        assert_eq!(out, [0x1C0, 0x180, 0x140, 0x100]);
        assert_eq!(renderer.phase(), PlaybackPhase::Stopping);
        assert_eq!(control.phase(), PlaybackPhase::Stopping);

        let mut out = [7i16; 8];
        renderer.render(&mut out);
        assert_eq!(&out[..4], &[0xC0, 0x80, 0x40, 0]);
        assert!(out[4..].iter().all(|&s| s == 0));
        assert_eq!(renderer.phase(), PlaybackPhase::Stopped);
        assert_eq!(control.phase(), PlaybackPhase::Stopped);
        assert_eq!(control.last_level(), CENTER_LEVEL);
        // 停止过程不算欠载
        assert_eq!(stats.underrun_count(), 0);
    }

    #[test]
    fn test_restart_during_stopping_reprimes() {
        let (mut writer, mut renderer, control, stats) =
            renderer_i16(16, 64, PlaybackConfig::default());
        control.request_start();
        renderer.phase = PlaybackPhase::Playing;
        writer.write_samples(&[biased(0x1000); 64]);
        let mut out = [0i16; 64];
        renderer.render(&mut out);

        control.request_stop();
        let mut out = [0i16; 2];
        renderer.render(&mut out);
        assert_eq!(renderer.phase(), PlaybackPhase::Stopping);

        assert_eq!(renderer.level(), 0x9000 - 0x80);

        // 缓冲区空：重新预缓冲，先斜坡回中心，之后只输出中心电平
        control.request_start();
        let mut out = [7i16; 64];
        renderer.render(&mut out);
        assert_eq!(renderer.phase(), PlaybackPhase::Starting);
        // 0xF80 / 0x40 = 62 个样本
        assert_eq!(out[0], 0x0F40);
        assert!(out[..62].windows(2).all(|w| w[1] == w[0] - 0x40));
        assert_eq!(out[61], 0);
        assert!(out[62..].iter().all(|&s| s == 0));
        assert_eq!(renderer.level(), CENTER_LEVEL);
        assert_eq!(stats.take_second().unwrap().min, 0);

        let mut out = [7i16; 16];
        renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_stopped_emits_center_without_consuming() {
        let (mut writer, mut renderer, _control, stats) =
            renderer_i16(16, 64, PlaybackConfig::default());
        writer.write_samples(&[biased(500); 16 * 64]);

        let mut out = [9i16; 32];
        renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(renderer.phase(), PlaybackPhase::Stopped);
        assert_eq!(renderer.reader.available(), 16 * 64);
        // 停止状态不产生水位测量，不会驱动时钟反馈
        assert_eq!(stats.take_second(), None);
    }

    #[test]
    fn test_u8_output() {
        let (mut writer, reader) = SampleBuffer::<u8>::new(BufferConfig {
            buffers: 4,
            block_len: 8,
        })
        .unwrap()
        .split();
        let control = Arc::new(PlaybackControl::new());
        let stats = Arc::new(PlaybackStats::new(4));
        let mut renderer = Renderer::new(
            reader,
            Arc::clone(&control),
            stats,
            &PlaybackConfig {
                prime_buffers: 1,
                ramp_step: 0x100,
                ..PlaybackConfig::default()
            },
        );
        control.request_start();

        writer.write_samples(&[0x83; 8]);
        let mut out = [0u8; 6];
        renderer.render(&mut out);
        assert_eq!(out, [0x81, 0x82, 0x83, 0x83, 0x83, 0x83]);
        assert_eq!(renderer.phase(), PlaybackPhase::Playing);
    }

    #[test]
    fn test_config_validation() {
        assert!(PlaybackConfig::default().validate(16).is_ok());
        let bad = PlaybackConfig {
            prime_buffers: 17,
            ..PlaybackConfig::default()
        };
        assert!(bad.validate(16).is_err());
        let bad = PlaybackConfig {
            ramp_step: 0,
            ..PlaybackConfig::default()
        };
        assert!(bad.validate(16).is_err());
    }
}
