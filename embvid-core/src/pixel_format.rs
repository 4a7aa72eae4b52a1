use std::fmt::{self, Display};

/// 四字符代码 (Four Character Code)，与 V4L2 pixelformat 字段一致
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct FourCC(pub u32);

impl FourCC {
    /// 从 ASCII 字符创建 FourCC
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self((a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24))
    }
}

impl Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();

        write!(f, "{}", String::from_utf8_lossy(&bytes))
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

impl From<u32> for FourCC {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

/// 传感器能输出的 V4L2 像素格式
impl FourCC {
    // --- RGB ---
    /// RGB565 (V4L2_PIX_FMT_RGB565)
    pub const RGB565: Self = Self::new(b'R', b'G', b'B', b'P');
    /// RGB24 (R-G-B)
    pub const RGB24: Self = Self::new(b'R', b'G', b'B', b'3');

    // --- YUV ---
    /// YUYV 4:2:2
    pub const YUYV: Self = Self::new(b'Y', b'U', b'Y', b'V');
    /// UYVY 4:2:2
    pub const UYVY: Self = Self::new(b'U', b'Y', b'V', b'Y');
    /// YUV 4:2:0 planar (V4L2_PIX_FMT_YUV420)
    pub const YUV420: Self = Self::new(b'Y', b'U', b'1', b'2');
    /// 8-bit 灰度
    pub const GREY: Self = Self::new(b'G', b'R', b'E', b'Y');

    // --- 压缩格式 ---
    pub const JPEG: Self = Self::new(b'J', b'P', b'E', b'G');
    pub const H264: Self = Self::new(b'H', b'2', b'6', b'4');

    // --- Bayer 原始数据 (BGGR 排列) ---
    /// Raw Bayer 8-bit
    pub const SBGGR8: Self = Self::new(b'B', b'A', b'8', b'1');
    /// Raw Bayer 10-bit，按 16-bit 存放
    pub const SBGGR10: Self = Self::new(b'B', b'G', b'1', b'0');
    /// Raw Bayer 12-bit，按 16-bit 存放
    pub const SBGGR12: Self = Self::new(b'B', b'G', b'1', b'2');
}

/// YUV422 的字节序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum YuvOrder {
    Yuyv,
    Uyvy,
}

/// 传感器格式描述中的像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum SensorPixelFormat {
    Rgb565,
    Yuv422(YuvOrder),
    Yuv420,
    Jpeg,
    Raw8,
    Raw10,
    Raw12,
    Grayscale,
}

impl SensorPixelFormat {
    /// 对应的 V4L2 FourCC
    pub const fn fourcc(&self) -> FourCC {
        match self {
            Self::Rgb565 => FourCC::RGB565,
            Self::Yuv422(YuvOrder::Yuyv) => FourCC::YUYV,
            Self::Yuv422(YuvOrder::Uyvy) => FourCC::UYVY,
            Self::Yuv420 => FourCC::YUV420,
            Self::Jpeg => FourCC::JPEG,
            Self::Raw8 => FourCC::SBGGR8,
            Self::Raw10 => FourCC::SBGGR10,
            Self::Raw12 => FourCC::SBGGR12,
            Self::Grayscale => FourCC::GREY,
        }
    }

    pub fn from_fourcc(cc: FourCC) -> Option<Self> {
        let fmt = match cc {
            FourCC::RGB565 => Self::Rgb565,
            FourCC::YUYV => Self::Yuv422(YuvOrder::Yuyv),
            FourCC::UYVY => Self::Yuv422(YuvOrder::Uyvy),
            FourCC::YUV420 => Self::Yuv420,
            FourCC::JPEG => Self::Jpeg,
            FourCC::SBGGR8 => Self::Raw8,
            FourCC::SBGGR10 => Self::Raw10,
            FourCC::SBGGR12 => Self::Raw12,
            FourCC::GREY => Self::Grayscale,
            _ => return None,
        };
        Some(fmt)
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Jpeg)
    }

    /// 判断是否为 Bayer 原始格式 (需要 ISP 处理)
    pub fn is_bayer(&self) -> bool {
        matches!(self, Self::Raw8 | Self::Raw10 | Self::Raw12)
    }

    /// 内存中每像素比特数 (RAW10/12 按 16-bit 存放)
    pub fn bits_per_pixel(&self) -> u32 {
        match self {
            Self::Rgb565 | Self::Yuv422(_) | Self::Raw10 | Self::Raw12 => 16,
            Self::Yuv420 => 12,
            Self::Raw8 | Self::Grayscale => 8,
            // 压缩格式没有固定 bpp，按最坏情况估算
            Self::Jpeg => 4,
        }
    }

    /// 每行字节数；压缩格式为 0 (V4L2 约定)
    pub fn bytes_per_line(&self, width: u32) -> u32 {
        match self {
            Self::Jpeg => 0,
            // 平面格式的 bytesperline 指 Y 平面
            Self::Yuv420 => width,
            _ => width * self.bits_per_pixel() / 8,
        }
    }

    /// 单帧最大字节数 (V4L2 sizeimage)
    pub fn image_size(&self, width: u32, height: u32) -> u32 {
        width * height * self.bits_per_pixel() / 8
    }
}

impl Display for SensorPixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rgb565 => "RGB565",
            Self::Yuv422(YuvOrder::Yuyv) => "YUV422 (YUYV)",
            Self::Yuv422(YuvOrder::Uyvy) => "YUV422 (UYVY)",
            Self::Yuv420 => "YUV420",
            Self::Jpeg => "JPEG",
            Self::Raw8 => "RAW8",
            Self::Raw10 => "RAW10",
            Self::Raw12 => "RAW12",
            Self::Grayscale => "Grayscale",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_matches_v4l2_encoding() {
        // V4L2_PIX_FMT_YUYV = v4l2_fourcc('Y','U','Y','V') = 0x56595559
        assert_eq!(FourCC::YUYV.0, 0x5659_5559);
        assert_eq!(FourCC::JPEG.to_string(), "JPEG");
        assert_eq!(format!("{:?}", FourCC::RGB565), "FourCC(RGBP)");
    }

    #[test]
    fn fourcc_round_trips_through_sensor_format() {
        for fmt in [
            SensorPixelFormat::Rgb565,
            SensorPixelFormat::Yuv422(YuvOrder::Uyvy),
            SensorPixelFormat::Yuv420,
            SensorPixelFormat::Jpeg,
            SensorPixelFormat::Raw10,
            SensorPixelFormat::Grayscale,
        ] {
            assert_eq!(SensorPixelFormat::from_fourcc(fmt.fourcc()), Some(fmt));
        }
        assert_eq!(SensorPixelFormat::from_fourcc(FourCC::H264), None);
    }

    #[test]
    fn frame_geometry() {
        let yuv = SensorPixelFormat::Yuv422(YuvOrder::Yuyv);
        assert_eq!(yuv.bytes_per_line(640), 1280);
        assert_eq!(yuv.image_size(640, 480), 640 * 480 * 2);
        assert_eq!(SensorPixelFormat::Yuv420.image_size(320, 240), 320 * 240 * 3 / 2);
        assert_eq!(SensorPixelFormat::Jpeg.bytes_per_line(640), 0);
        assert!(SensorPixelFormat::Raw12.is_bayer());
    }
}
