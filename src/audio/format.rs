//! 样本格式与电平换算
//!
//! 环形缓冲区里保存的是输出原生格式的样本（8-bit 无符号或 16-bit 有符号）。
//! 过渡引擎在做斜坡时统一使用 "电平"（level）：一个以 0x8000 为中心的 u16，
//! 这样两种位深可以共用同一套斜坡逻辑。
//!
//! - 8-bit:  level = sample << 8,           sample = level >> 8
//! - 16-bit: level = sample + 0x8000 (wrap), sample = level - 0x8000 (wrap)

use std::fmt::Debug;

/// 中心电平（静音）
pub const CENTER_LEVEL: u16 = 0x8000;

/// 单声道 PCM 样本类型
///
/// 模拟器写入的 16-bit 数据是带 0x8000 偏置的无符号值（按位存进 i16），
/// 整块写完后由 [`PcmSample::normalize`] 就地去偏置。
pub trait PcmSample: Copy + Default + PartialEq + Debug + Send + Sync + 'static {
    /// 位深
    const BITS: u16;

    /// 静音样本（原生格式）
    const SILENCE: Self;

    /// 原生样本 → 电平
    fn to_level(self) -> u16;

    /// 电平 → 原生样本
    fn from_level(level: u16) -> Self;

    /// 生产者原始写入值 → 原生格式（对刚写完的块就地执行一次）
    fn normalize(self) -> Self;

    /// 该格式是否需要去偏置
    const NEEDS_NORMALIZE: bool;
}

impl PcmSample for u8 {
    const BITS: u16 = 8;
    const SILENCE: Self = 0x80;
    const NEEDS_NORMALIZE: bool = false;

    #[inline]
    fn to_level(self) -> u16 {
        (self as u16) << 8
    }

    #[inline]
    fn from_level(level: u16) -> Self {
        (level >> 8) as u8
    }

    #[inline]
    fn normalize(self) -> Self {
        self
    }
}

impl PcmSample for i16 {
    const BITS: u16 = 16;
    const SILENCE: Self = 0;
    const NEEDS_NORMALIZE: bool = true;

    #[inline]
    fn to_level(self) -> u16 {
        (self as u16).wrapping_add(CENTER_LEVEL)
    }

    #[inline]
    fn from_level(level: u16) -> Self {
        level.wrapping_sub(CENTER_LEVEL) as i16
    }

    /// 无符号偏置 → 有符号：减 0x8000（等价于翻转符号位）
    #[inline]
    fn normalize(self) -> Self {
        ((self as u16) ^ CENTER_LEVEL) as i16
    }
}

/// 流格式描述（交给输出后端）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// 后端每次回调拉取的样本数
    pub block_frames: usize,
}

impl StreamFormat {
    /// 创建新的流格式
    pub fn new<T: PcmSample>(sample_rate: u32, block_frames: usize) -> Self {
        Self {
            sample_rate,
            bits_per_sample: T::BITS,
            block_frames,
        }
    }

    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// 回调周期（纳秒）
    #[inline]
    pub fn callback_period_ns(&self) -> u64 {
        self.block_frames as u64 * 1_000_000_000 / self.sample_rate.max(1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_level_mapping() {
        assert_eq!(u8::SILENCE.to_level(), CENTER_LEVEL);
        assert_eq!(u8::from_level(CENTER_LEVEL), 0x80);
        assert_eq!(0xFFu8.to_level(), 0xFF00);
        assert_eq!(u8::from_level(0x12FF), 0x12);
        // 8-bit 不需要去偏置
        assert_eq!(0x37u8.normalize(), 0x37);
    }

    #[test]
    fn test_i16_level_mapping() {
        assert_eq!(i16::SILENCE.to_level(), CENTER_LEVEL);
        assert_eq!(i16::from_level(CENTER_LEVEL), 0);
        assert_eq!(i16::MIN.to_level(), 0);
        assert_eq!(i16::MAX.to_level(), u16::MAX);
        for v in [-32768i16, -1, 0, 1, 1234, 32767] {
            assert_eq!(i16::from_level(v.to_level()), v);
        }
    }

    #[test]
    fn test_i16_bias_removal() {
        // 生产者写入 0x8000（无符号中心）→ 去偏置后为 0
        let raw = 0x8000u16 as i16;
        assert_eq!(raw.normalize(), 0);
        // 0xFFFF → 0x7FFF
        assert_eq!((0xFFFFu16 as i16).normalize(), i16::MAX);
        // 0x0000 → -32768
        assert_eq!(0i16.normalize(), i16::MIN);
    }

    #[test]
    fn test_callback_period() {
        let format = StreamFormat::new::<i16>(22255, 1024);
        assert_eq!(format.bytes_per_sample(), 2);
        // 1024 / 22255 Hz ≈ 46.01 ms
        let period_ms = format.callback_period_ns() / 1_000_000;
        assert_eq!(period_ms, 46);
    }
}
