use crate::error::{Result, VideoError};
use crate::format::{FormatIter, SensorFormat, SensorPort};
use crate::param::{ParamDesc, ParamId};
use crate::sensor::{IoctlReply, SensorCapability, SensorId, SensorIoctl};

/// 寄存器地址宽度，每个传感器家族固定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum AddrWidth {
    Bits8,
    Bits16,
}

impl AddrWidth {
    /// 该宽度下的最大合法地址
    pub const fn max_addr(&self) -> u16 {
        match self {
            Self::Bits8 => 0xff,
            Self::Bits16 => 0xffff,
        }
    }
}

// --- 外部协作者：SCCB 传输、GPIO、XCLK ---

/// 1. SCCB (I2C 兼容) 传输端点
///
/// 一个实例对应总线上的一个从机地址。值宽度固定为 8 bit。
pub trait SccbIo: Send {
    fn addr_width(&self) -> AddrWidth;

    fn read(&mut self, addr: u16) -> Result<u8>;

    fn write(&mut self, addr: u16, value: u8) -> Result<()>;
}

impl<T: SccbIo + ?Sized> SccbIo for Box<T> {
    fn addr_width(&self) -> AddrWidth {
        (**self).addr_width()
    }

    fn read(&mut self, addr: u16) -> Result<u8> {
        (**self).read(addr)
    }

    fn write(&mut self, addr: u16, value: u8) -> Result<()> {
        (**self).write(addr, value)
    }
}

/// 2. GPIO 控制器 (复位 / 掉电引脚)
pub trait GpioController: Send + Sync {
    fn set_level(&self, pin: u32, high: bool) -> Result<()>;
}

/// 3. 外部时钟 (XCLK) 发生器
pub trait ClockSource: Send + Sync {
    fn enable(&self, pin: u32, freq_hz: u32) -> Result<()>;

    fn disable(&self, pin: u32) -> Result<()>;
}

// --- 传感器驱动契约 ---

/// 每个图像传感器驱动实现的多态接口
///
/// 驱动不支持的操作必须显式返回 [`VideoError::NotSupported`]。
/// 可选操作 (参数、私有 ioctl) 的默认实现就是这样做的。
pub trait CameraSensor: Send {
    /// 驱动名 (e.g. "SC030IOT")
    fn name(&self) -> &str;

    /// 探测阶段读到的芯片 ID
    fn id(&self) -> SensorId;

    /// 当前连接的接口
    fn port(&self) -> SensorPort;

    /// 当前接口下支持的格式，惰性、有限、可重复遍历
    fn formats(&self) -> FormatIter;

    /// 支持的像素家族
    fn capability(&self) -> SensorCapability;

    /// 应用格式描述中的寄存器脚本
    ///
    /// `None` 选择驱动的默认格式。脚本失败时返回 `SetFormatFailed`，
    /// 当前格式保持不变。
    fn set_format(&mut self, format: Option<&'static SensorFormat>) -> Result<()>;

    /// 当前格式 (从未设置过则为 None)
    fn format(&self) -> Option<&'static SensorFormat>;

    fn set_stream(&mut self, on: bool) -> Result<()>;

    fn is_streaming(&self) -> bool;

    fn param_desc(&self, id: ParamId) -> Result<ParamDesc> {
        Err(VideoError::not_supported(format!("{}: no description for {:?}", self.name(), id)))
    }

    fn param(&self, id: ParamId) -> Result<i32> {
        Err(VideoError::not_supported(format!("{}: cannot read {:?}", self.name(), id)))
    }

    /// 设置参数；有描述时实现必须先用 [`ParamDesc::validate`] 校验
    fn set_param(&mut self, id: ParamId, value: i32) -> Result<()> {
        let _ = value;
        Err(VideoError::not_supported(format!("{}: cannot write {:?}", self.name(), id)))
    }

    /// 驱动私有控制的逃生舱口
    fn ioctl(&mut self, cmd: SensorIoctl) -> Result<IoctlReply> {
        Err(VideoError::not_supported(format!("{}: ioctl {:?}", self.name(), cmd)))
    }

    /// 按上电的逆序断电并释放实例
    fn delete(self: Box<Self>) -> Result<()>;

    /// 导出当前状态快照 (用于诊断)
    #[cfg(feature = "serialize")]
    fn export_state(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "pid": self.id().pid,
            "port": self.port(),
            "format": self.format().map(|f| f.name),
            "streaming": self.is_streaming(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(u8);

    impl SccbIo for Echo {
        fn addr_width(&self) -> AddrWidth {
            AddrWidth::Bits8
        }

        fn read(&mut self, _addr: u16) -> Result<u8> {
            Ok(self.0)
        }

        fn write(&mut self, _addr: u16, value: u8) -> Result<()> {
            self.0 = value;
            Ok(())
        }
    }

    #[test]
    fn boxed_transport_forwards() {
        let mut bus: Box<dyn SccbIo> = Box::new(Echo(0));
        bus.write(0x12, 0x5a).unwrap();
        assert_eq!(bus.read(0x12).unwrap(), 0x5a);
        assert_eq!(bus.addr_width().max_addr(), 0xff);
    }
}
