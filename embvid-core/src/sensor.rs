use std::fmt;

use bitflags::bitflags;

use crate::builder::SensorConfig;
use crate::error::{Result, VideoError};
use crate::format::{SensorFormat, SensorPort};
use crate::pixel_format::SensorPixelFormat;
use crate::power::PowerControl;
use crate::regscript;
use crate::time::Ticker;
use crate::traits::{CameraSensor, SccbIo};

bitflags! {
    /// 传感器支持的像素家族
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SensorCapability: u32 {
        const YUV  = 1 << 0;
        const RGB  = 1 << 1;
        const RAW  = 1 << 2;
        const JPEG = 1 << 3;
    }
}

impl SensorCapability {
    /// 由格式表推导
    pub fn from_formats<'a>(formats: impl IntoIterator<Item = &'a SensorFormat>) -> Self {
        formats
            .into_iter()
            .fold(Self::empty(), |caps, f| caps | Self::of(f.pixel_format))
    }

    pub fn of(fmt: SensorPixelFormat) -> Self {
        match fmt {
            SensorPixelFormat::Yuv422(_) | SensorPixelFormat::Yuv420 | SensorPixelFormat::Grayscale => Self::YUV,
            SensorPixelFormat::Rgb565 => Self::RGB,
            SensorPixelFormat::Raw8 | SensorPixelFormat::Raw10 | SensorPixelFormat::Raw12 => Self::RAW,
            SensorPixelFormat::Jpeg => Self::JPEG,
        }
    }
}

/// 探测时读到的芯片身份
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorId {
    pub pid: u16,
}

/// 驱动私有控制命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorIoctl {
    /// 硬件复位 (RESET 引脚脉冲)
    HwReset,
    /// 软件复位 (写复位寄存器)
    SwReset,
    SetReg { addr: u16, value: u8 },
    GetReg { addr: u16 },
    GetChipId,
    SetStream(bool),
    SetTestPattern(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    Reg(u8),
    ChipId(SensorId),
}

/// 单个传感器实例的公共状态
///
/// 具体驱动内嵌这个结构体，再加上自己的私有状态。
pub struct SensorDevice {
    pub name: &'static str,
    pub sccb: Box<dyn SccbIo>,
    pub power: PowerControl,
    pub port: SensorPort,
    pub ticker: Ticker,
    pub cur_format: Option<&'static SensorFormat>,
    pub id: SensorId,
    pub stream_on: bool,
}

impl fmt::Debug for SensorDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorDevice")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("pid", &format_args!("{:#06x}", self.id.pid))
            .field("format", &self.cur_format.map(|f| f.name))
            .field("stream_on", &self.stream_on)
            .finish()
    }
}

impl SensorDevice {
    pub fn new(name: &'static str, config: SensorConfig) -> Self {
        let (sccb, power, port, ticker) = config.into_parts();
        Self {
            name,
            sccb,
            power,
            port,
            ticker,
            cur_format: None,
            id: SensorId::default(),
            stream_on: false,
        }
    }

    /// 上电、读芯片 ID、比对
    ///
    /// 上电中途失败、ID 不匹配或读取失败时都先断电再返回错误。
    pub fn detect<F>(&mut self, expected: u16, read_pid: F) -> Result<()>
    where
        F: FnOnce(&mut dyn SccbIo) -> Result<u16>,
    {
        if let Err(e) = self.power.power_on() {
            self.power_off_logged();
            return Err(e);
        }

        let found = match read_pid(self.sccb.as_mut()) {
            Ok(pid) => pid,
            Err(e) => {
                self.power_off_logged();
                return Err(e);
            }
        };

        if found != expected {
            self.power_off_logged();
            tracing::warn!(
                target: "embvid::sensor",
                "{}: chip id mismatch, expected {:#06x} found {:#06x}",
                self.name,
                expected,
                found
            );
            return Err(VideoError::ProbeMismatch { expected, found });
        }

        self.id = SensorId { pid: found };
        tracing::info!(target: "embvid::sensor", "Detected {} (PID {:#06x}) on {}", self.name, found, self.port);
        Ok(())
    }

    fn power_off_logged(&self) {
        if let Err(e) = self.power.power_off() {
            tracing::warn!(target: "embvid::sensor", "{}: power off failed: {}", self.name, e);
        }
    }

    /// 执行格式脚本；失败时保留原格式
    pub fn apply_format(&mut self, format: &'static SensorFormat) -> Result<()> {
        if format.port != self.port {
            return Err(VideoError::invalid_arg(format!(
                "format {} targets {} but sensor is on {}",
                format.name, format.port, self.port
            )));
        }

        if let Err(e) = regscript::play(self.sccb.as_mut(), &format.regs, &self.ticker) {
            tracing::error!(target: "embvid::sensor", "{}: format {} failed: {}", self.name, format.name, e);
            return Err(VideoError::SetFormatFailed(format.name.to_string()));
        }

        tracing::info!(
            target: "embvid::sensor",
            "{}: format {} ({}x{} {} @ {} fps)",
            self.name,
            format.name,
            format.width,
            format.height,
            format.pixel_format,
            format.fps
        );
        self.cur_format = Some(format);
        Ok(())
    }

    pub fn set_bits(&mut self, addr: u16, offset: u8, length: u8, value: u8) -> Result<()> {
        regscript::set_bits(self.sccb.as_mut(), addr, offset, length, value)
    }

    /// 断电，用于 `delete`
    pub fn shutdown(&mut self) -> Result<()> {
        self.stream_on = false;
        self.power.power_off()
    }
}

/// 驱动的 probe 入口
pub type ProbeFn = fn(SensorConfig) -> Result<Box<dyn CameraSensor>>;

/// 自动探测表项：驱动声明自己的接口和 SCCB 从机地址
#[derive(Clone, Copy)]
pub struct DetectEntry {
    pub name: &'static str,
    pub port: SensorPort,
    pub sccb_addr: u16,
    pub probe: ProbeFn,
}

impl fmt::Debug for DetectEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectEntry")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("sccb_addr", &format_args!("{:#04x}", self.sccb_addr))
            .finish()
    }
}
