//! 音频核心模块
//!
//! 包含：
//! - Format: 样本格式与电平换算
//! - Ring Buffer: Lock-free 块粒度样本缓冲区
//! - Transition: 开始/停止/欠载的去爆音状态机（输出回调内运行）
//! - Stats: 水位与播放统计
//! - Output: 输出后端接口
//! - Timing: 墙钟毫秒计数

pub mod format;
pub mod output;
pub mod ring_buffer;
pub mod stats;
pub mod timing;
pub mod transition;

pub use format::{PcmSample, StreamFormat, CENTER_LEVEL};
pub use output::{AudioBackend, NullOutput, OutputConfig, OutputError, ThreadedOutput};
pub use ring_buffer::{BufferConfig, SampleBuffer, SampleReader, SampleWriter, WriteRegion};
pub use stats::{FillWindow, PlaybackStats, StatsReport};
pub use timing::{ManualClock, MonotonicClock, WallClock};
pub use transition::{PlaybackConfig, PlaybackControl, PlaybackPhase, Renderer};
