//! 输出后端
//!
//! 平台音频后端以固定周期调用拉取回调。这里只定义后端接口，
//! 并提供两个实现：
//! - `ThreadedOutput`: 用专用线程按 `block_frames / sample_rate` 的周期拉取，
//!   把渲染好的块交给 sink（模拟硬件设备）
//! - `NullOutput`: 总是打开失败，系统静音运行

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use thiserror::Error;

use super::format::{PcmSample, StreamFormat};
use super::transition::Renderer;

/// 输出配置
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputConfig {
    /// 输出采样率
    pub sample_rate: u32,
    /// 每次回调拉取的样本数
    pub block_frames: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            // round(7833600 * 2 / 704)
            sample_rate: 22255,
            block_frames: 1024,
        }
    }
}

/// 音频输出错误
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("No audio output device: {0}")]
    NoDevice(String),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Failed to spawn output thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Output thread panicked")]
    ThreadPanicked,
}

/// 平台音频后端
///
/// `start` 之后，后端在自己的执行上下文里周期性调用 `Renderer::render`。
pub trait AudioBackend<T: PcmSample>: Send {
    /// 打开设备并开始周期拉取
    fn start(&mut self, format: StreamFormat, renderer: Renderer<T>) -> Result<(), OutputError>;

    /// 停止拉取（可重复调用）
    fn stop(&mut self) -> Result<(), OutputError>;

    fn is_running(&self) -> bool;
}

/// 每个渲染块的去向
pub type BlockSink<T> = Box<dyn FnMut(&[T]) + Send + 'static>;

/// 线程驱动的定周期输出
pub struct ThreadedOutput<T: PcmSample> {
    sink: Option<BlockSink<T>>,
    running: Arc<CachePadded<AtomicBool>>,
    thread: Option<JoinHandle<BlockSink<T>>>,
}

impl<T: PcmSample> ThreadedOutput<T> {
    /// `sink` 在输出线程上接收每个渲染好的块
    pub fn new(sink: BlockSink<T>) -> Self {
        Self {
            sink: Some(sink),
            running: Arc::new(CachePadded::new(AtomicBool::new(false))),
            thread: None,
        }
    }

    /// 丢弃输出的后端
    pub fn discard() -> Self {
        Self::new(Box::new(|_: &[T]| {}))
    }

    /// 输出线程主函数
    ///
    /// 按绝对时间点调度，避免 sleep 误差累积；
    /// 落后超过 4 个周期时直接重新对齐（宿主挂起之类）
    fn output_thread_main(
        format: StreamFormat,
        mut renderer: Renderer<T>,
        mut sink: BlockSink<T>,
        running: Arc<CachePadded<AtomicBool>>,
    ) -> BlockSink<T> {
        let period = Duration::from_nanos(format.callback_period_ns());
        let mut block = vec![T::SILENCE; format.block_frames];
        let mut deadline = Instant::now();

        log::info!(
            "Output thread started: {} frames @ {}Hz ({}µs period)",
            format.block_frames,
            format.sample_rate,
            period.as_micros()
        );

        while running.load(Ordering::Acquire) {
            renderer.render(&mut block);
            sink(&block);

            deadline += period;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            } else if now - deadline > period * 4 {
                log::debug!("Output thread fell behind by {:?}, resyncing", now - deadline);
                deadline = now;
            }
        }

        log::info!("Output thread finished");
        sink
    }
}

impl<T: PcmSample> AudioBackend<T> for ThreadedOutput<T> {
    fn start(&mut self, format: StreamFormat, renderer: Renderer<T>) -> Result<(), OutputError> {
        if self.thread.is_some() {
            return Err(OutputError::InvalidState("Output already started"));
        }
        if format.block_frames == 0 || format.sample_rate == 0 {
            return Err(OutputError::InvalidState("Output format has no frames"));
        }
        let sink = self
            .sink
            .take()
            .ok_or(OutputError::InvalidState("Output sink missing"))?;

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);

        let handle = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || Self::output_thread_main(format, renderer, sink, running));

        match handle {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(OutputError::Spawn(e))
            }
        }
    }

    fn stop(&mut self) -> Result<(), OutputError> {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.thread.take() {
            // 回收 sink，允许再次 start
            let sink = handle.join().map_err(|_| OutputError::ThreadPanicked)?;
            self.sink = Some(sink);
            log::info!("Audio output stopped");
        }

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.thread.is_some() && self.running.load(Ordering::Acquire)
    }
}

impl<T: PcmSample> Drop for ThreadedOutput<T> {
    fn drop(&mut self) {
        let _ = AudioBackend::<T>::stop(self);
    }
}

/// 没有声音设备
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl<T: PcmSample> AudioBackend<T> for NullOutput {
    fn start(&mut self, _format: StreamFormat, _renderer: Renderer<T>) -> Result<(), OutputError> {
        Err(OutputError::NoDevice("sound disabled".to_string()))
    }

    fn stop(&mut self) -> Result<(), OutputError> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        false
    }
}
