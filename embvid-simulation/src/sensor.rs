//! 仿真 DVP 传感器 "SIMCAM"
//!
//! 8-bit SCCB 地址 + 0xfe 页寄存器，驱动侧按 16-bit `(page << 8) | offset`
//! 访问。参数值在驱动里保留一份影子，寄存器只写不回读。

use std::collections::HashMap;

use embvid_core::builder::SensorConfig;
use embvid_core::error::{Result, VideoError};
use embvid_core::format::{BayerPattern, FormatIter, IspInfo, SensorFormat, SensorPort};
use embvid_core::param::{ParamDesc, ParamId};
use embvid_core::pixel_format::{SensorPixelFormat, YuvOrder};
use embvid_core::regscript::{reg, PagedRegisters, RegScript, RegValue, ScriptMarkers};
use embvid_core::sensor::{DetectEntry, IoctlReply, SensorCapability, SensorDevice, SensorId, SensorIoctl};
use embvid_core::traits::{AddrWidth, CameraSensor, SccbIo};

use crate::bus::SimBus;

pub const NAME: &str = "SIMCAM";
pub const SIM_PID: u16 = 0x5a47;
pub const SCCB_ADDR: u16 = 0x21;
pub const PAGE_SELECT: u8 = 0xfe;

// 寄存器表 (page << 8 | offset)
pub const CHIP_ID_H: u16 = 0x00f0;
pub const CHIP_ID_L: u16 = 0x00f1;
pub const OUTPUT_EN: u16 = 0x00f2;
/// bit7: 软复位
pub const SYS_CTRL: u16 = 0x0012;
/// bit0: 水平镜像，bit1: 垂直翻转
pub const CISCTL_MODE1: u16 = 0x0014;
/// bit0: 出流
pub const ANALOG_MODE: u16 = 0x0017;
pub const VBLANK: u16 = 0x0007;
pub const OUTPUT_FMT: u16 = 0x0024;
/// bit0: 彩条测试图
pub const DEBUG_MODE: u16 = 0x002e;
pub const WIN_WIDTH_H: u16 = 0x0105;
pub const WIN_WIDTH_L: u16 = 0x0106;
pub const WIN_HEIGHT_H: u16 = 0x0107;
pub const WIN_HEIGHT_L: u16 = 0x0108;
pub const AE_TARGET: u16 = 0x0113;
pub const BRIGHTNESS: u16 = 0x0120;
pub const CONTRAST: u16 = 0x0121;
pub const SATURATION: u16 = 0x0122;
pub const SPECIAL_EFFECT: u16 = 0x0123;
pub const AWB_MODE: u16 = 0x0124;
pub const ANTI_BANDING: u16 = 0x0125;
pub const LOCK_3A: u16 = 0x0130;
pub const JPEG_QUALITY: u16 = 0x0240;

const REG_DELAY: u16 = 0xfffe;
const REG_END: u16 = 0xffff;
const MARKERS: ScriptMarkers = ScriptMarkers {
    delay_addr: Some(REG_DELAY),
    end_addr: Some(REG_END),
};

static VGA_YUYV_15FPS: [RegValue; 11] = [
    reg(SYS_CTRL, 0x80),
    reg(REG_DELAY, 5),
    reg(SYS_CTRL, 0x00),
    reg(WIN_WIDTH_H, 0x02),
    reg(WIN_WIDTH_L, 0x80),
    reg(WIN_HEIGHT_H, 0x01),
    reg(WIN_HEIGHT_L, 0xe0),
    reg(OUTPUT_FMT, 0xa2),
    reg(VBLANK, 0x40),
    reg(PAGE_SELECT as u16, 0x00),
    reg(REG_END, 0x00),
];

static QVGA_RGB565_30FPS: [RegValue; 11] = [
    reg(SYS_CTRL, 0x80),
    reg(REG_DELAY, 5),
    reg(SYS_CTRL, 0x00),
    reg(WIN_WIDTH_H, 0x01),
    reg(WIN_WIDTH_L, 0x40),
    reg(WIN_HEIGHT_H, 0x00),
    reg(WIN_HEIGHT_L, 0xf0),
    reg(OUTPUT_FMT, 0xa6),
    reg(VBLANK, 0x00),
    reg(PAGE_SELECT as u16, 0x00),
    reg(REG_END, 0x00),
];

static VGA_RAW8_30FPS: [RegValue; 11] = [
    reg(SYS_CTRL, 0x80),
    reg(REG_DELAY, 5),
    reg(SYS_CTRL, 0x00),
    reg(WIN_WIDTH_H, 0x02),
    reg(WIN_WIDTH_L, 0x80),
    reg(WIN_HEIGHT_H, 0x01),
    reg(WIN_HEIGHT_L, 0xe0),
    reg(OUTPUT_FMT, 0xb7),
    reg(VBLANK, 0x00),
    reg(PAGE_SELECT as u16, 0x00),
    reg(REG_END, 0x00),
];

static VGA_JPEG_15FPS: [RegValue; 12] = [
    reg(SYS_CTRL, 0x80),
    reg(REG_DELAY, 5),
    reg(SYS_CTRL, 0x00),
    reg(WIN_WIDTH_H, 0x02),
    reg(WIN_WIDTH_L, 0x80),
    reg(WIN_HEIGHT_H, 0x01),
    reg(WIN_HEIGHT_L, 0xe0),
    reg(OUTPUT_FMT, 0xc0),
    reg(VBLANK, 0x40),
    reg(JPEG_QUALITY, 12),
    reg(PAGE_SELECT as u16, 0x00),
    reg(REG_END, 0x00),
];

/// 第一项为默认格式
pub static FORMATS: [SensorFormat; 4] = [
    SensorFormat {
        name: "DVP_8bit_20Minput_YUV422_640x480_15fps",
        pixel_format: SensorPixelFormat::Yuv422(YuvOrder::Yuyv),
        port: SensorPort::Dvp,
        xclk: 20_000_000,
        width: 640,
        height: 480,
        fps: 15,
        regs: RegScript::with_markers(&VGA_YUYV_15FPS, MARKERS),
        isp_info: None,
        mipi_info: None,
    },
    SensorFormat {
        name: "DVP_8bit_20Minput_RGB565_320x240_30fps",
        pixel_format: SensorPixelFormat::Rgb565,
        port: SensorPort::Dvp,
        xclk: 20_000_000,
        width: 320,
        height: 240,
        fps: 30,
        regs: RegScript::with_markers(&QVGA_RGB565_30FPS, MARKERS),
        isp_info: None,
        mipi_info: None,
    },
    SensorFormat {
        name: "DVP_8bit_20Minput_RAW8_640x480_30fps",
        pixel_format: SensorPixelFormat::Raw8,
        port: SensorPort::Dvp,
        xclk: 20_000_000,
        width: 640,
        height: 480,
        fps: 30,
        regs: RegScript::with_markers(&VGA_RAW8_30FPS, MARKERS),
        isp_info: Some(IspInfo {
            pclk: 20_000_000,
            vts: 660,
            hts: 1010,
            bayer: BayerPattern::Bggr,
        }),
        mipi_info: None,
    },
    SensorFormat {
        name: "DVP_8bit_20Minput_JPEG_640x480_15fps",
        pixel_format: SensorPixelFormat::Jpeg,
        port: SensorPort::Dvp,
        xclk: 20_000_000,
        width: 640,
        height: 480,
        fps: 15,
        regs: RegScript::with_markers(&VGA_JPEG_15FPS, MARKERS),
        isp_info: None,
        mipi_info: None,
    },
];

/// 自动探测表项
pub static DETECT: DetectEntry = DetectEntry {
    name: NAME,
    port: SensorPort::Dvp,
    sccb_addr: SCCB_ADDR,
    probe,
};

/// 预置了芯片 ID 的总线
pub fn sensor_bus() -> SimBus {
    let bus = SimBus::paged(PAGE_SELECT);
    bus.preset(CHIP_ID_H, (SIM_PID >> 8) as u8);
    bus.preset(CHIP_ID_L, SIM_PID as u8);
    bus
}

fn read_chip_id(bus: &mut dyn SccbIo) -> Result<u16> {
    let hi = bus.read(CHIP_ID_H)?;
    let lo = bus.read(CHIP_ID_L)?;
    Ok(((hi as u16) << 8) | lo as u16)
}

pub fn probe(mut config: SensorConfig) -> Result<Box<dyn CameraSensor>> {
    if config.sccb.addr_width() != AddrWidth::Bits8 {
        return Err(VideoError::invalid_arg(format!("{NAME}: expects an 8-bit SCCB bus")));
    }
    config.sccb = Box::new(PagedRegisters::new(config.sccb, PAGE_SELECT));

    let mut dev = SensorDevice::new(NAME, config);
    dev.detect(SIM_PID, read_chip_id)?;
    Ok(Box::new(SimSensor::new(dev)))
}

/// 在一条仿真总线上直接探测 (DVP)
pub fn probe_on(bus: SimBus) -> Result<Box<dyn CameraSensor>> {
    probe(SensorConfig::new(Box::new(bus), SensorPort::Dvp))
}

#[derive(Debug)]
pub struct SimSensor {
    dev: SensorDevice,
    status: HashMap<ParamId, i32>,
}

impl SimSensor {
    fn new(dev: SensorDevice) -> Self {
        let mut sensor = Self {
            dev,
            status: HashMap::new(),
        };
        sensor.reset_status();
        sensor
    }

    fn reset_status(&mut self) {
        self.status = ParamId::ALL
            .iter()
            .filter_map(|&id| describe(id).map(|desc| (id, desc.default_value())))
            .collect();
    }

    fn write_param(&mut self, id: ParamId, value: i32) -> Result<()> {
        let bit = value as u8 & 1;
        match id {
            ParamId::HMirror => self.dev.set_bits(CISCTL_MODE1, 0, 1, bit),
            ParamId::VFlip => self.dev.set_bits(CISCTL_MODE1, 1, 1, bit),
            ParamId::TestPattern => self.dev.set_bits(DEBUG_MODE, 0, 1, bit),
            ParamId::Brightness => self.dev.sccb.write(BRIGHTNESS, value as i8 as u8),
            ParamId::Contrast => self.dev.sccb.write(CONTRAST, value as i8 as u8),
            ParamId::Saturation => self.dev.sccb.write(SATURATION, value as i8 as u8),
            ParamId::AeTarget => self.dev.sccb.write(AE_TARGET, value as u8),
            ParamId::JpegQuality => self.dev.sccb.write(JPEG_QUALITY, value as u8),
            ParamId::SpecialEffect => self.dev.sccb.write(SPECIAL_EFFECT, value as u8),
            ParamId::WhiteBalance => self.dev.sccb.write(AWB_MODE, value as u8),
            ParamId::AntiBanding => self.dev.sccb.write(ANTI_BANDING, value as u8),
            ParamId::Lock3A => self.dev.sccb.write(LOCK_3A, value as u8),
            ParamId::FlashLed | ParamId::SensorFps => Err(self.unsupported(id)),
        }
    }

    fn unsupported(&self, id: ParamId) -> VideoError {
        VideoError::not_supported(format!("{}: no {:?} control", self.dev.name, id))
    }

    /// 软复位后寄存器回到上电值，格式需要重新设置
    fn forget_state(&mut self) {
        self.dev.cur_format = None;
        self.dev.stream_on = false;
        self.reset_status();
    }
}

fn describe(id: ParamId) -> Option<ParamDesc> {
    let desc = match id {
        ParamId::VFlip | ParamId::HMirror | ParamId::TestPattern => ParamDesc::switch(false),
        ParamId::Brightness | ParamId::Contrast | ParamId::Saturation => ParamDesc::Number {
            min: -2,
            max: 2,
            step: 1,
            default: 0,
        },
        ParamId::AeTarget => ParamDesc::Number {
            min: 0,
            max: 255,
            step: 1,
            default: 0x48,
        },
        ParamId::JpegQuality => ParamDesc::Number {
            min: 1,
            max: 63,
            step: 1,
            default: 12,
        },
        // V4L2_COLORFX_{NONE, BW, SEPIA, NEGATIVE, EMBOSS, SKY_BLUE, GRASS_GREEN}
        ParamId::SpecialEffect => ParamDesc::Enumeration {
            elements: vec![0, 1, 2, 3, 4, 8, 9],
            default: 0,
        },
        // auto, 白炽灯, 荧光灯, 日光, 阴天
        ParamId::WhiteBalance => ParamDesc::Enumeration {
            elements: vec![1, 3, 4, 6, 8],
            default: 1,
        },
        // 关, 50 Hz, 60 Hz
        ParamId::AntiBanding => ParamDesc::Enumeration {
            elements: vec![0, 1, 2],
            default: 1,
        },
        // AE | AWB | AF
        ParamId::Lock3A => ParamDesc::Bitmask {
            valid_bits: 0b111,
            default: 0,
        },
        ParamId::FlashLed | ParamId::SensorFps => return None,
    };
    Some(desc)
}

impl CameraSensor for SimSensor {
    fn name(&self) -> &str {
        self.dev.name
    }

    fn id(&self) -> SensorId {
        self.dev.id
    }

    fn port(&self) -> SensorPort {
        self.dev.port
    }

    fn formats(&self) -> FormatIter {
        FormatIter::new(&FORMATS, self.dev.port)
    }

    fn capability(&self) -> SensorCapability {
        SensorCapability::from_formats(self.formats())
    }

    fn set_format(&mut self, format: Option<&'static SensorFormat>) -> Result<()> {
        let format = match format {
            Some(format) => format,
            None => self
                .formats()
                .next()
                .ok_or_else(|| VideoError::not_supported(format!("{}: no format on {}", NAME, self.dev.port)))?,
        };
        self.dev.apply_format(format)
    }

    fn format(&self) -> Option<&'static SensorFormat> {
        self.dev.cur_format
    }

    fn set_stream(&mut self, on: bool) -> Result<()> {
        self.dev.set_bits(ANALOG_MODE, 0, 1, on as u8)?;
        self.dev.sccb.write(OUTPUT_EN, if on { 0x0f } else { 0x00 })?;
        self.dev.stream_on = on;
        tracing::debug!(target: "embvid::sensor", "{}: stream {}", self.dev.name, if on { "on" } else { "off" });
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.dev.stream_on
    }

    fn param_desc(&self, id: ParamId) -> Result<ParamDesc> {
        describe(id).ok_or_else(|| self.unsupported(id))
    }

    fn param(&self, id: ParamId) -> Result<i32> {
        self.status.get(&id).copied().ok_or_else(|| self.unsupported(id))
    }

    fn set_param(&mut self, id: ParamId, value: i32) -> Result<()> {
        self.param_desc(id)?.validate(value)?;
        self.write_param(id, value)?;
        self.status.insert(id, value);
        tracing::debug!(target: "embvid::sensor", "{}: {:?} = {}", self.dev.name, id, value);
        Ok(())
    }

    fn ioctl(&mut self, cmd: SensorIoctl) -> Result<IoctlReply> {
        match cmd {
            SensorIoctl::HwReset => {
                self.dev.power.reset_pulse()?;
                self.forget_state();
            }
            SensorIoctl::SwReset => {
                self.dev.set_bits(SYS_CTRL, 7, 1, 1)?;
                self.dev.ticker.delay_ms(5);
                self.dev.set_bits(SYS_CTRL, 7, 1, 0)?;
                self.forget_state();
            }
            SensorIoctl::SetReg { addr, value } => self.dev.sccb.write(addr, value)?,
            SensorIoctl::GetReg { addr } => return Ok(IoctlReply::Reg(self.dev.sccb.read(addr)?)),
            SensorIoctl::GetChipId => {
                let pid = read_chip_id(self.dev.sccb.as_mut())?;
                return Ok(IoctlReply::ChipId(SensorId { pid }));
            }
            SensorIoctl::SetStream(on) => self.set_stream(on)?,
            SensorIoctl::SetTestPattern(on) => self.set_param(ParamId::TestPattern, on as i32)?,
        }
        Ok(IoctlReply::Done)
    }

    fn delete(mut self: Box<Self>) -> Result<()> {
        tracing::debug!(target: "embvid::sensor", "{}: delete", self.dev.name);
        self.dev.shutdown()
    }
}
