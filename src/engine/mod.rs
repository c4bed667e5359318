//! 声音同步引擎
//!
//! 模拟循环一侧的唯一上下文，整合缓冲、时钟、输出各模块。
//! 核心设计：模拟循环和输出回调完全解耦，通过 lock-free 块缓冲区连接；
//! 回调侧持有 `Renderer`，两边只共享 `PlaybackControl` 和 `PlaybackStats`。

use std::sync::Arc;
use std::thread;

use crate::audio::{
    AudioBackend, BufferConfig, OutputConfig, OutputError, PcmSample, PlaybackConfig,
    PlaybackControl, PlaybackPhase, PlaybackStats, Renderer, SampleBuffer, SampleWriter,
    StatsReport, StreamFormat, WallClock, WriteRegion,
};
use crate::clock::{ClockConfig, DriftClock, Nudge, TickPacer, TickUpdate};
use crate::error::{check_range, ConfigError};

/// 引擎配置
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    /// 缓冲区几何
    pub buffer: BufferConfig,
    /// 模拟时钟
    pub clock: ClockConfig,
    /// 过渡与反馈
    pub playback: PlaybackConfig,
    /// 输出配置
    pub output: OutputConfig,
    /// 是否 mlock 样本缓冲区
    pub lock_memory: bool,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.buffer.validate()?;
        self.clock.validate()?;
        self.playback.validate(self.buffer.buffers)?;
        check_range("sample_rate", self.output.sample_rate as u64, 1000, 384_000)?;
        check_range(
            "block_frames",
            self.output.block_frames as u64,
            1,
            self.buffer.capacity() as u64,
        )
    }

    /// 缓冲区满时的最大延迟（毫秒）
    pub fn buffer_latency_ms(&self) -> f64 {
        self.buffer.capacity() as f64 * 1000.0 / self.output.sample_rate as f64
    }

    /// 期望水位对应的延迟（毫秒）
    pub fn target_latency_ms(&self) -> f64 {
        (self.playback.desired_min_filled * self.buffer.block_len) as f64 * 1000.0
            / self.output.sample_rate as f64
    }
}

/// 声音同步引擎（模拟循环持有）
pub struct SoundEngine<T: PcmSample> {
    config: EngineConfig,
    format: StreamFormat,
    clock: DriftClock,
    pacer: TickPacer,
    writer: SampleWriter<T>,
    control: Arc<PlaybackControl>,
    stats: Arc<PlaybackStats>,
    backend: Box<dyn AudioBackend<T>>,
    init_error: Option<OutputError>,
}

impl<T: PcmSample> SoundEngine<T> {
    /// 创建缓冲区并启动输出后端
    ///
    /// 只有配置错误才会失败。后端打不开时记录一次警告，
    /// 引擎以无声模式继续运行（时钟照常推进）。
    pub fn open(
        config: EngineConfig,
        wall_ms: u32,
        mut backend: Box<dyn AudioBackend<T>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let buffer = SampleBuffer::<T>::new(config.buffer)?;
        if config.lock_memory {
            buffer.lock_memory();
        }
        let (writer, reader) = buffer.split();

        let control = Arc::new(PlaybackControl::new());
        let stats = Arc::new(PlaybackStats::new(config.buffer.buffers));
        let renderer = Renderer::new(
            reader,
            Arc::clone(&control),
            Arc::clone(&stats),
            &config.playback,
        );

        let format = StreamFormat::new::<T>(config.output.sample_rate, config.output.block_frames);
        let init_error = match backend.start(format, renderer) {
            Ok(()) => {
                log::info!(
                    "Sound opened: {}Hz {}-bit, {} × {} samples ({:.0}ms)",
                    format.sample_rate,
                    format.bits_per_sample,
                    config.buffer.buffers,
                    config.buffer.block_len,
                    config.buffer_latency_ms()
                );
                None
            }
            Err(e) => {
                log::warn!("No sound available, running silent: {}", e);
                Some(e)
            }
        };

        let clock = DriftClock::new(config.clock, wall_ms);
        let pacer = TickPacer::new(&clock);

        Ok(Self {
            config,
            format,
            clock,
            pacer,
            writer,
            control,
            stats,
            backend,
            init_error,
        })
    }

    #[inline]
    pub fn has_sound(&self) -> bool {
        self.init_error.is_none()
    }

    /// 后端初始化失败的原因
    pub fn init_error(&self) -> Option<&OutputError> {
        self.init_error.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn clock(&self) -> &DriftClock {
        &self.clock
    }

    pub fn buffer(&self) -> &Arc<SampleBuffer<T>> {
        self.writer.buffer()
    }

    /// 回调最近发布的播放阶段
    pub fn phase(&self) -> PlaybackPhase {
        self.control.phase()
    }

    // ========== 生产者 ==========

    /// 申请写入空间，见 [`SampleWriter::begin_write`]
    #[inline]
    pub fn begin_write(&mut self, requested: usize) -> WriteRegion<'_, T> {
        self.writer.begin_write(requested)
    }

    /// 提交写入；发布了整块时返回已填充块数
    #[inline]
    pub fn end_write(&mut self, actual: usize) -> Option<u32> {
        let filled = self.writer.end_write(actual);
        if let Some(filled) = filled {
            self.stats.observe_max(filled);
        }
        filled
    }

    /// 写入整段样本
    ///
    /// 无声模式下直接丢弃（没有消费者，写进去只会不停溢出）
    pub fn write_samples(&mut self, src: &[T]) -> usize {
        if !self.has_sound() {
            return src.len();
        }

        let mut written = 0;
        while written < src.len() {
            let n = self
                .writer
                .begin_write(src.len() - written)
                .copy_from_slice(&src[written..]);
            self.end_write(n);
            written += n;
        }
        written
    }

    // ========== 播放控制 ==========

    /// 请求开始播放（实际开始要等回调预缓冲完成）
    pub fn start(&mut self) {
        if !self.has_sound() || self.control.wants_playing() {
            return;
        }
        self.stats.reset_window();
        self.control.request_start();
        log::info!("Sound start requested");
    }

    /// 请求停止并等待停止斜坡完成
    ///
    /// 最多轮询 `stop_retry_limit` 次。超时只记录警告（尽力去爆音），
    /// 返回是否确认已停止。
    pub fn stop(&mut self) -> bool {
        if !self.has_sound() {
            return true;
        }
        if !self.control.wants_playing() && self.control.phase() == PlaybackPhase::Stopped {
            return true;
        }
        self.control.request_stop();

        for _ in 0..self.config.playback.stop_retry_limit {
            if self.control.phase() == PlaybackPhase::Stopped {
                log::info!("Sound stopped");
                return true;
            }
            thread::sleep(self.config.playback.stop_retry_delay);
        }

        log::warn!(
            "Sound stop timed out in {:?}, output may click",
            self.control.phase()
        );
        false
    }

    /// 从暂停恢复：时钟重新对齐到 `wall_ms`，丢弃积压的 tick，然后开始播放
    pub fn resume(&mut self, wall_ms: u32) {
        self.clock.resync(wall_ms);
        self.pacer.catch_up(&self.clock);
        self.start();
    }

    // ========== 时钟 ==========

    /// 推进时钟，返回新 tick 数；跨过墙钟秒时执行缓冲区反馈
    pub fn advance(&mut self, wall_ms: u32) -> u32 {
        let ticks = self.clock.advance(wall_ms);
        self.pacer.catch_up(&self.clock);
        if self.clock.take_second_elapsed() {
            self.second_notify();
        }
        ticks
    }

    /// 等到下一个 tick；跨过墙钟秒时执行缓冲区反馈
    pub fn wait_for_next_tick<W, D>(&mut self, wall: &W, delay: D) -> TickUpdate
    where
        W: WallClock + ?Sized,
        D: FnMut(u32),
    {
        let update = self.pacer.wait_for_next_tick(&mut self.clock, wall, delay);
        if update.second_elapsed {
            self.second_notify();
        }
        update
    }

    /// 每秒一次的缓冲区反馈
    ///
    /// 用本秒最少填充块数和期望值比较，微调模拟时钟，然后重置统计。
    /// 本秒没有测量（未播放或无声）时什么都不做。
    pub fn second_notify(&mut self) -> Option<Nudge> {
        if !self.has_sound() {
            return None;
        }

        let window = self.stats.take_second()?;
        let desired = self.config.playback.desired_min_filled;

        log::debug!(
            "Buffer fill last second: min {} max {} (desired {})",
            window.min,
            window.max,
            desired
        );

        let nudge = if window.min > desired {
            Nudge::SlowDown
        } else if window.min < desired {
            Nudge::SpeedUp
        } else {
            return None;
        };

        self.clock.nudge(nudge);
        self.stats.record_nudge(nudge == Nudge::SpeedUp);
        Some(nudge)
    }

    /// 统计报告
    pub fn stats(&self) -> StatsReport {
        self.stats
            .report(self.buffer().overflow_count(), self.clock.true_time())
    }

    /// 停止播放并关闭后端
    pub fn shutdown(&mut self) -> Result<(), OutputError> {
        self.stop();
        self.backend.stop()
    }
}

impl<T: PcmSample> Drop for SoundEngine<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("Failed to close audio output: {}", e);
        }
    }
}
