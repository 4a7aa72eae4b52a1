use std::fmt;

use crate::error::{Result, VideoError};

/// 传感器参数 ID (封闭集合)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamId {
    VFlip,
    HMirror,
    /// 自动曝光目标亮度
    AeTarget,
    JpegQuality,
    SpecialEffect,
    WhiteBalance,
    /// 工频抗闪烁
    AntiBanding,
    Brightness,
    Contrast,
    Saturation,
    TestPattern,
    FlashLed,
    /// AE / AWB / AF 锁定位
    Lock3A,
    SensorFps,
}

impl ParamId {
    pub const ALL: [ParamId; 14] = [
        Self::VFlip,
        Self::HMirror,
        Self::AeTarget,
        Self::JpegQuality,
        Self::SpecialEffect,
        Self::WhiteBalance,
        Self::AntiBanding,
        Self::Brightness,
        Self::Contrast,
        Self::Saturation,
        Self::TestPattern,
        Self::FlashLed,
        Self::Lock3A,
        Self::SensorFps,
    ];
}

/// 参数描述，三种形态互斥
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamDesc {
    Number {
        min: i32,
        max: i32,
        step: u32,
        default: i32,
    },
    Enumeration {
        elements: Vec<i32>,
        default: i32,
    },
    Bitmask {
        valid_bits: u32,
        default: u32,
    },
}

impl ParamDesc {
    /// 0/1 开关 (翻转、镜像等)
    pub fn switch(default: bool) -> Self {
        Self::Number {
            min: 0,
            max: 1,
            step: 1,
            default: default as i32,
        }
    }

    pub fn default_value(&self) -> i32 {
        match self {
            Self::Number { default, .. } | Self::Enumeration { default, .. } => *default,
            Self::Bitmask { default, .. } => *default as i32,
        }
    }

    /// 按描述校验待写入的值
    pub fn validate(&self, value: i32) -> Result<()> {
        let ok = match self {
            Self::Number { min, max, step, .. } => {
                let step = (*step).max(1) as i64;
                value >= *min && value <= *max && (value as i64 - *min as i64) % step == 0
            }
            Self::Enumeration { elements, .. } => elements.contains(&value),
            Self::Bitmask { valid_bits, .. } => (value as u32) & !valid_bits == 0,
        };

        if ok {
            Ok(())
        } else {
            Err(VideoError::invalid_arg(format!("value {value} rejected by {self}")))
        }
    }
}

impl fmt::Display for ParamDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number { min, max, step, .. } => write!(f, "number [{min}, {max}] step {step}"),
            Self::Enumeration { elements, .. } => write!(f, "enumeration {elements:?}"),
            Self::Bitmask { valid_bits, .. } => write!(f, "bitmask {valid_bits:#x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_checks_range_and_step() {
        let desc = ParamDesc::Number {
            min: -4,
            max: 8,
            step: 4,
            default: 0,
        };
        assert!(desc.validate(-4).is_ok());
        assert!(desc.validate(4).is_ok());
        assert!(desc.validate(8).is_ok());
        assert!(desc.validate(2).is_err());
        assert!(desc.validate(12).is_err());
        assert!(desc.validate(-8).is_err());
    }

    #[test]
    fn enumeration_checks_membership() {
        let desc = ParamDesc::Enumeration {
            elements: vec![0, 2, 5],
            default: 0,
        };
        assert!(desc.validate(5).is_ok());
        assert!(desc.validate(1).is_err());
        assert_eq!(desc.default_value(), 0);
    }

    #[test]
    fn bitmask_rejects_bits_outside_mask() {
        let desc = ParamDesc::Bitmask {
            valid_bits: 0b0111,
            default: 0,
        };
        assert!(desc.validate(0b0101).is_ok());
        assert!(desc.validate(0b1000).is_err());
        assert!(desc.validate(-1).is_err());
    }

    #[test]
    fn switch_is_a_zero_one_number() {
        assert_eq!(
            ParamDesc::switch(false),
            ParamDesc::Number {
                min: 0,
                max: 1,
                step: 1,
                default: 0
            }
        );
    }
}
