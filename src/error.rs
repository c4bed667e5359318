//! 配置错误
//!
//! 音频路径本身没有硬错误（溢出、欠载、时钟停顿都有降级行为），
//! 只有配置和输出设备初始化会失败。

use thiserror::Error;

/// 配置校验错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} must be a power of two, got {value}")]
    NotPowerOfTwo { name: &'static str, value: u64 },

    #[error("{name} must be at least {min}, got {value}")]
    TooSmall {
        name: &'static str,
        value: u64,
        min: u64,
    },

    #[error("{name} must be at most {max}, got {value}")]
    TooLarge {
        name: &'static str,
        value: u64,
        max: u64,
    },
}

/// 校验 2 的幂
pub(crate) fn check_power_of_two(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(ConfigError::NotPowerOfTwo { name, value })
    }
}

/// 校验闭区间
pub(crate) fn check_range(
    name: &'static str,
    value: u64,
    min: u64,
    max: u64,
) -> Result<(), ConfigError> {
    if value < min {
        Err(ConfigError::TooSmall { name, value, min })
    } else if value > max {
        Err(ConfigError::TooLarge { name, value, max })
    } else {
        Ok(())
    }
}
