//! 合成模拟器
//!
//! 用一个方波音源代替模拟器核心，按模拟时钟的节拍往引擎里写样本，
//! 可选地注入随机的宿主卡顿，验证整条同步链路。

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::audio::{PcmSample, StatsReport, WallClock, CENTER_LEVEL};
use crate::clock::FRAC_BITS;
use crate::engine::SoundEngine;

/// 方波音源
///
/// 输出的是生产者格式：16-bit 为带 0x8000 偏置的无符号值，8-bit 原样。
#[derive(Debug, Clone)]
pub struct ToneSource {
    /// 半周期（样本数）
    half_period: u32,
    amplitude: u16,
    pos: u32,
}

impl ToneSource {
    pub fn new(sample_rate: u32, tone_hz: u32, amplitude: u16) -> Self {
        Self {
            half_period: (sample_rate / tone_hz.max(1) / 2).max(1),
            amplitude: amplitude.min(CENTER_LEVEL - 1),
            pos: 0,
        }
    }

    /// 下一个电平
    pub fn next_level(&mut self) -> u16 {
        let high = self.pos < self.half_period;
        self.pos += 1;
        if self.pos >= self.half_period * 2 {
            self.pos = 0;
        }
        if high {
            CENTER_LEVEL + self.amplitude
        } else {
            CENTER_LEVEL - self.amplitude
        }
    }

    /// 下一个样本（生产者格式）
    #[inline]
    pub fn next_sample<T: PcmSample>(&mut self) -> T {
        // 去偏置是自反的：原生样本再做一次就得到生产者写入值
        T::from_level(self.next_level()).normalize()
    }
}

/// 每个 tick 的样本数（定点累加，不丢样本）
#[derive(Debug, Clone)]
pub struct SamplesPerTick {
    /// sample_rate × step，单位 1 / (1000 << FRAC_BITS) 样本
    per_tick: u64,
    acc: u64,
}

impl SamplesPerTick {
    pub fn new(sample_rate: u32, step: u32) -> Self {
        Self {
            per_tick: sample_rate as u64 * step as u64,
            acc: 0,
        }
    }

    pub fn next_tick(&mut self) -> usize {
        const UNIT: u64 = 1000 << FRAC_BITS;
        self.acc += self.per_tick;
        let n = self.acc / UNIT;
        self.acc %= UNIT;
        n as usize
    }
}

/// 模拟参数
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub duration: Duration,
    /// 方波频率
    pub tone_hz: u32,
    pub amplitude: u16,
    /// 最大随机卡顿（毫秒，0 表示不卡）
    pub jitter_ms: u32,
    /// 每个 tick 发生卡顿的概率
    pub jitter_probability: f64,
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            tone_hz: 440,
            amplitude: 0x1000,
            jitter_ms: 0,
            jitter_probability: 0.02,
            seed: None,
        }
    }
}

/// 运行合成模拟器，直到时长用完或 `running` 被清除
pub fn run_simulation<T, W>(
    engine: &mut SoundEngine<T>,
    wall: &W,
    config: &SimConfig,
    running: &AtomicBool,
) -> StatsReport
where
    T: PcmSample,
    W: WallClock + ?Sized,
{
    let sample_rate = engine.format().sample_rate;
    let mut tone = ToneSource::new(sample_rate, config.tone_hz, config.amplitude);
    let mut per_tick = SamplesPerTick::new(sample_rate, engine.config().clock.step);
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    log::info!(
        "Simulating {:?}: {}Hz tone, jitter up to {}ms",
        config.duration,
        config.tone_hz,
        config.jitter_ms
    );

    engine.resume(wall.now_ms());
    let end = Instant::now() + config.duration;

    while running.load(Ordering::SeqCst) && Instant::now() < end {
        let update = engine.wait_for_next_tick(wall, |ms| {
            thread::sleep(Duration::from_millis(ms as u64))
        });

        for _ in 0..update.ticks {
            emulate_tick(engine, &mut tone, per_tick.next_tick());
        }

        if config.jitter_ms > 0 && rng.gen_bool(config.jitter_probability) {
            let stall = rng.gen_range(1..=config.jitter_ms);
            log::trace!("Host stall {}ms", stall);
            thread::sleep(Duration::from_millis(stall as u64));
        }
    }

    engine.stop();
    engine.stats()
}

/// 一个 tick 的声音输出
fn emulate_tick<T: PcmSample>(engine: &mut SoundEngine<T>, tone: &mut ToneSource, samples: usize) {
    if !engine.has_sound() {
        return;
    }

    let mut remaining = samples;
    while remaining > 0 {
        let region = engine.begin_write(remaining);
        let len = region.len();
        for i in 0..len {
            region.set(i, tone.next_sample::<T>());
        }
        engine.end_write(len);
        remaining -= len;
    }
}
