use embvid_core::pixel_format::{FourCC, SensorPixelFormat};

use crate::uapi::{V4L2_COLORSPACE_JPEG, V4L2_COLORSPACE_RAW, V4L2_COLORSPACE_SRGB};

/// ENUM_FMT 的 description 字段
pub fn description(cc: FourCC) -> &'static str {
    match cc {
        // --- 1. YUV ---
        FourCC::YUYV => "YUYV 4:2:2",
        FourCC::UYVY => "UYVY 4:2:2",
        FourCC::YUV420 => "Planar YUV 4:2:0",
        FourCC::GREY => "8-bit Greyscale",

        // --- 2. RGB ---
        FourCC::RGB565 => "16-bit RGB 5-6-5",
        FourCC::RGB24 => "24-bit RGB 8-8-8",

        // --- 3. 压缩格式 ---
        FourCC::JPEG => "JFIF JPEG",
        FourCC::H264 => "H.264",

        // --- 4. Bayer ---
        FourCC::SBGGR8 => "8-bit Bayer BGBG/GRGR",
        FourCC::SBGGR10 => "10-bit Bayer BGBG/GRGR",
        FourCC::SBGGR12 => "12-bit Bayer BGBG/GRGR",

        _ => {
            tracing::warn!(target: "embvid::v4l2", "No description for pixel format {}", cc);
            "Unknown"
        }
    }
}

/// G_FMT 的 colorspace 字段
pub fn colorspace(cc: FourCC) -> u32 {
    match SensorPixelFormat::from_fourcc(cc) {
        Some(SensorPixelFormat::Jpeg) => V4L2_COLORSPACE_JPEG,
        Some(f) if f.is_bayer() => V4L2_COLORSPACE_RAW,
        _ => V4L2_COLORSPACE_SRGB,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colorspace_follows_format_family() {
        assert_eq!(colorspace(FourCC::JPEG), V4L2_COLORSPACE_JPEG);
        assert_eq!(colorspace(FourCC::SBGGR8), V4L2_COLORSPACE_RAW);
        assert_eq!(colorspace(FourCC::YUYV), V4L2_COLORSPACE_SRGB);
        assert_eq!(description(FourCC::RGB565), "16-bit RGB 5-6-5");
    }
}
