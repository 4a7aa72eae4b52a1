use std::fmt;

use crate::pixel_format::{FourCC, SensorPixelFormat};
use crate::regscript::RegScript;

/// SoC 侧的相机接口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum SensorPort {
    /// 并行 DVP
    Dvp,
    MipiCsi,
    Spi,
}

impl fmt::Display for SensorPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dvp => "DVP",
            Self::MipiCsi => "MIPI-CSI",
            Self::Spi => "SPI",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum BayerPattern {
    Bggr,
    Gbrg,
    Grbg,
    Rggb,
}

/// ISP 需要的时序元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct IspInfo {
    pub pclk: u32,
    pub vts: u32,
    pub hts: u32,
    pub bayer: BayerPattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct MipiInfo {
    pub mipi_clk: u32,
    pub lane_num: u8,
    pub line_sync_en: bool,
}

/// 传感器的静态格式描述
///
/// 一条记录对应一组寄存器配置：分辨率、像素格式、帧率和接口一起决定。
#[derive(Debug, Clone, Copy)]
pub struct SensorFormat {
    pub name: &'static str,
    pub pixel_format: SensorPixelFormat,
    pub port: SensorPort,
    /// 期望的外部时钟 (Hz)
    pub xclk: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub regs: RegScript<'static>,
    pub isp_info: Option<IspInfo>,
    pub mipi_info: Option<MipiInfo>,
}

impl SensorFormat {
    pub fn fourcc(&self) -> FourCC {
        self.pixel_format.fourcc()
    }

    pub fn bytes_per_line(&self) -> u32 {
        self.pixel_format.bytes_per_line(self.width)
    }

    pub fn image_size(&self) -> u32 {
        self.pixel_format.image_size(self.width, self.height)
    }

    /// 几何与像素格式是否一致 (不比较帧率)
    pub fn matches(&self, width: u32, height: u32, fourcc: FourCC) -> bool {
        self.width == width && self.height == height && self.fourcc() == fourcc
    }
}

impl PartialEq for SensorFormat {
    fn eq(&self, other: &Self) -> bool {
        // 描述都是静态表项，按内容中的身份字段比较
        self.name == other.name
            && self.port == other.port
            && self.fps == other.fps
            && self.matches(other.width, other.height, other.fourcc())
    }
}

/// 某个接口下的格式序列
///
/// 克隆或重新调用 `formats()` 即可从头遍历。
#[derive(Debug, Clone)]
pub struct FormatIter {
    table: &'static [SensorFormat],
    port: SensorPort,
    pos: usize,
}

impl FormatIter {
    pub fn new(table: &'static [SensorFormat], port: SensorPort) -> Self {
        Self { table, port, pos: 0 }
    }
}

impl Iterator for FormatIter {
    type Item = &'static SensorFormat;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(fmt) = self.table.get(self.pos) {
            self.pos += 1;
            if fmt.port == self.port {
                return Some(fmt);
            }
        }
        None
    }
}
