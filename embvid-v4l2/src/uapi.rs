//! V4L2 线上结构体与请求码 (Linux ABI)
//!
//! 来源: /usr/include/linux/videodev2.h, v4l2-controls.h。
//! 手动定义，布局按 `#[repr(C)]` 与内核头文件一致；所有结构体都是
//! `Zeroable`，填充前先整体清零。

use std::ffi::c_void;
use std::mem::size_of;

use bitflags::bitflags;
use bytemuck::Zeroable;

// --- 缓冲区 / 内存 / 场 ---

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_FIELD_NONE: u32 = 1;

pub const V4L2_COLORSPACE_JPEG: u32 = 7;
pub const V4L2_COLORSPACE_SRGB: u32 = 8;
pub const V4L2_COLORSPACE_RAW: u32 = 11;

pub const V4L2_BUF_FLAG_MAPPED: u32 = 0x0000_0001;
pub const V4L2_BUF_FLAG_QUEUED: u32 = 0x0000_0002;
pub const V4L2_BUF_FLAG_DONE: u32 = 0x0000_0004;
pub const V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC: u32 = 0x0000_2000;

pub const V4L2_BUF_CAP_SUPPORTS_MMAP: u32 = 1 << 0;

/// v4l2_captureparm.capability
pub const V4L2_CAP_TIMEPERFRAME: u32 = 0x1000;

pub const V4L2_FRMSIZE_TYPE_DISCRETE: u32 = 1;

pub const V4L2_CTRL_TYPE_INTEGER: u32 = 1;
pub const V4L2_CTRL_TYPE_MENU: u32 = 3;
pub const V4L2_CTRL_TYPE_BITMASK: u32 = 8;
pub const V4L2_CTRL_MAX_DIMS: usize = 4;
pub const V4L2_CTRL_WHICH_CUR_VAL: u32 = 0;

bitflags! {
    /// v4l2_capability.capabilities / device_caps
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct V4l2Caps: u32 {
        const VIDEO_CAPTURE   = 0x0000_0001;
        const VIDEO_OUTPUT    = 0x0000_0002;
        const VIDEO_M2M       = 0x0000_8000;
        const EXT_PIX_FORMAT  = 0x0020_0000;
        const READWRITE       = 0x0100_0000;
        const STREAMING       = 0x0400_0000;
        const DEVICE_CAPS     = 0x8000_0000;
    }
}

// --- 控制 ID ---
// 类基址来自 v4l2-controls.h

pub const V4L2_CID_BASE: u32 = 0x0098_0900;
pub const V4L2_CID_CAMERA_CLASS_BASE: u32 = 0x009a_0900;
pub const V4L2_CID_FLASH_CLASS_BASE: u32 = 0x009c_0900;
pub const V4L2_CID_JPEG_CLASS_BASE: u32 = 0x009d_0900;
pub const V4L2_CID_IMAGE_PROC_CLASS_BASE: u32 = 0x009f_0900;

pub const V4L2_CID_BRIGHTNESS: u32 = V4L2_CID_BASE;
pub const V4L2_CID_CONTRAST: u32 = V4L2_CID_BASE + 1;
pub const V4L2_CID_SATURATION: u32 = V4L2_CID_BASE + 2;
pub const V4L2_CID_HFLIP: u32 = V4L2_CID_BASE + 20; // 0x00980914
pub const V4L2_CID_VFLIP: u32 = V4L2_CID_BASE + 21; // 0x00980915
pub const V4L2_CID_POWER_LINE_FREQUENCY: u32 = V4L2_CID_BASE + 24;
pub const V4L2_CID_COLORFX: u32 = V4L2_CID_BASE + 31;

pub const V4L2_CID_AUTO_EXPOSURE_BIAS: u32 = V4L2_CID_CAMERA_CLASS_BASE + 19;
pub const V4L2_CID_AUTO_N_PRESET_WHITE_BALANCE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 20;
pub const V4L2_CID_3A_LOCK: u32 = V4L2_CID_CAMERA_CLASS_BASE + 27;

pub const V4L2_CID_FLASH_LED_MODE: u32 = V4L2_CID_FLASH_CLASS_BASE + 1;
pub const V4L2_CID_JPEG_COMPRESSION_QUALITY: u32 = V4L2_CID_JPEG_CLASS_BASE + 3;
pub const V4L2_CID_TEST_PATTERN: u32 = V4L2_CID_IMAGE_PROC_CLASS_BASE + 3;

// --- 结构体 ---

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct V4l2Capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct V4l2FmtDesc {
    pub index: u32,
    pub type_: u32,
    pub flags: u32,
    pub description: [u8; 32],
    pub pixelformat: u32,
    pub mbus_code: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable, PartialEq, Eq)]
pub struct V4l2PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

/// v4l2_format.fmt 联合体
///
/// 内核里它包含带指针的 v4l2_window，所以 64 位平台按 8 字节对齐。
#[cfg_attr(target_pointer_width = "64", repr(C, align(8)))]
#[cfg_attr(not(target_pointer_width = "64"), repr(C))]
#[derive(Clone, Copy, Zeroable)]
pub struct V4l2FormatUnion {
    pub pix: V4l2PixFormat,
    pub raw_data: [u8; 200 - size_of::<V4l2PixFormat>()],
}

impl std::fmt::Debug for V4l2FormatUnion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4l2FormatUnion").field("pix", &self.pix).finish()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct V4l2Format {
    pub type_: u32,
    pub fmt: V4l2FormatUnion,
}

impl V4l2Format {
    pub fn capture() -> Self {
        Self {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            ..Self::zeroed()
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

impl V4l2RequestBuffers {
    pub fn capture(count: u32) -> Self {
        Self {
            count,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: V4L2_MEMORY_MMAP,
            ..Self::zeroed()
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct Timeval {
    pub tv_sec: libc::c_long,
    pub tv_usec: libc::c_long,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: Timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    /// 联合体 m：MMAP 模式下只用低 32 位的 offset
    pub m: libc::c_ulong,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl V4l2Buffer {
    /// 构造一个待查询/入队的 MMAP 捕获缓冲描述
    pub fn capture(index: u32) -> Self {
        Self {
            index,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: V4L2_MEMORY_MMAP,
            ..Self::zeroed()
        }
    }

    pub fn offset(&self) -> u32 {
        self.m as u32
    }

    pub fn set_offset(&mut self, offset: u32) {
        self.m = offset as libc::c_ulong;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable, PartialEq, Eq)]
pub struct V4l2Fract {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct V4l2CaptureParm {
    pub capability: u32,
    pub capturemode: u32,
    pub timeperframe: V4l2Fract,
    pub extendedmode: u32,
    pub readbuffers: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
pub struct V4l2StreamParmUnion {
    pub capture: V4l2CaptureParm,
    pub raw_data: [u8; 200 - size_of::<V4l2CaptureParm>()],
}

impl std::fmt::Debug for V4l2StreamParmUnion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4l2StreamParmUnion").field("capture", &self.capture).finish()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct V4l2StreamParm {
    pub type_: u32,
    pub parm: V4l2StreamParmUnion,
}

impl V4l2StreamParm {
    pub fn capture() -> Self {
        Self {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            ..Self::zeroed()
        }
    }
}

/// v4l2_ext_control (内核里是 packed)
#[repr(C, packed)]
#[derive(Clone, Copy, Zeroable)]
pub struct V4l2ExtControl {
    pub id: u32,
    pub size: u32,
    pub reserved2: u32,
    /// 联合体：value (s32) / value64 (s64) / 指针
    pub value64: i64,
}

impl V4l2ExtControl {
    pub fn new(id: u32, value: i32) -> Self {
        Self {
            id,
            value64: value as i64,
            ..Self::zeroed()
        }
    }

    pub fn value(&self) -> i32 {
        self.value64 as i32
    }

    pub fn set_value(&mut self, value: i32) {
        self.value64 = value as i64;
    }
}

impl std::fmt::Debug for V4l2ExtControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id = self.id;
        f.debug_struct("V4l2ExtControl")
            .field("id", &format_args!("{id:#010x}"))
            .field("value", &self.value())
            .finish()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct V4l2ExtControls {
    /// ctrl_class / which
    pub which: u32,
    pub count: u32,
    pub error_idx: u32,
    pub request_fd: i32,
    pub reserved: [u32; 1],
    pub controls: *mut V4l2ExtControl,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct V4l2QueryExtCtrl {
    pub id: u32,
    pub type_: u32,
    pub name: [u8; 32],
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
    pub default_value: i64,
    pub flags: u32,
    pub elem_size: u32,
    pub elems: u32,
    pub nr_of_dims: u32,
    pub dims: [u32; V4L2_CTRL_MAX_DIMS],
    pub reserved: [u32; 32],
}

/// QUERYMENU 的参数
#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct V4l2QueryMenu {
    pub id: u32,
    pub index: u32,
    /// 联合体：name[32] / value (s64)，这里只用 value
    pub raw: [u8; 32],
    pub reserved: u32,
}

impl V4l2QueryMenu {
    pub fn new(id: u32, index: u32) -> Self {
        Self {
            id,
            index,
            ..Self::zeroed()
        }
    }

    pub fn value(&self) -> i64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.raw[..8]);
        i64::from_ne_bytes(bytes)
    }

    pub fn set_value(&mut self, value: i64) {
        self.raw = [0; 32];
        self.raw[..8].copy_from_slice(&value.to_ne_bytes());
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable, PartialEq, Eq)]
pub struct V4l2FrmSizeDiscrete {
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct V4l2FrmSizeEnum {
    pub index: u32,
    pub pixel_format: u32,
    pub type_: u32,
    /// 联合体：discrete 或 stepwise (6 x u32)
    pub discrete: V4l2FrmSizeDiscrete,
    pub stepwise_rest: [u32; 4],
    pub reserved: [u32; 2],
}

/// 私有 MMAP 请求：把 QUERYBUF 给出的 offset 翻译回载荷指针
#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
pub struct MmapRequest {
    pub length: u32,
    pub offset: u32,
    pub mapped_ptr: *mut c_void,
}

// --- 请求码 (_IOC 编码) ---

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const IOC_TYPE_V: u32 = b'V' as u32;
const BASE_VIDIOC_PRIVATE: u32 = 192;

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | (IOC_TYPE_V << 8) | nr
}

const fn ior(nr: u32, size: usize) -> u32 {
    ioc(IOC_READ, nr, size)
}

const fn iow(nr: u32, size: usize) -> u32 {
    ioc(IOC_WRITE, nr, size)
}

const fn iowr(nr: u32, size: usize) -> u32 {
    ioc(IOC_READ | IOC_WRITE, nr, size)
}

pub const VIDIOC_QUERYCAP: u32 = ior(0, size_of::<V4l2Capability>());
pub const VIDIOC_ENUM_FMT: u32 = iowr(2, size_of::<V4l2FmtDesc>());
pub const VIDIOC_G_FMT: u32 = iowr(4, size_of::<V4l2Format>());
pub const VIDIOC_S_FMT: u32 = iowr(5, size_of::<V4l2Format>());
pub const VIDIOC_REQBUFS: u32 = iowr(8, size_of::<V4l2RequestBuffers>());
pub const VIDIOC_QUERYBUF: u32 = iowr(9, size_of::<V4l2Buffer>());
pub const VIDIOC_QBUF: u32 = iowr(15, size_of::<V4l2Buffer>());
pub const VIDIOC_DQBUF: u32 = iowr(17, size_of::<V4l2Buffer>());
pub const VIDIOC_STREAMON: u32 = iow(18, size_of::<i32>());
pub const VIDIOC_STREAMOFF: u32 = iow(19, size_of::<i32>());
pub const VIDIOC_G_PARM: u32 = iowr(21, size_of::<V4l2StreamParm>());
pub const VIDIOC_S_PARM: u32 = iowr(22, size_of::<V4l2StreamParm>());
pub const VIDIOC_QUERYMENU: u32 = iowr(37, size_of::<V4l2QueryMenu>());
pub const VIDIOC_TRY_FMT: u32 = iowr(64, size_of::<V4l2Format>());
pub const VIDIOC_G_EXT_CTRLS: u32 = iowr(71, size_of::<V4l2ExtControls>());
pub const VIDIOC_S_EXT_CTRLS: u32 = iowr(72, size_of::<V4l2ExtControls>());
pub const VIDIOC_ENUM_FRAMESIZES: u32 = iowr(74, size_of::<V4l2FrmSizeEnum>());
pub const VIDIOC_QUERY_EXT_CTRL: u32 = iowr(103, size_of::<V4l2QueryExtCtrl>());
pub const VIDIOC_MMAP: u32 = iowr(BASE_VIDIOC_PRIVATE, size_of::<MmapRequest>());

// --- 字符串字段 ---

/// 以 NUL 结尾地拷贝到定长字段，超长截断
pub fn copy_cstr(dst: &mut [u8], src: &str) {
    dst.fill(0);
    let n = src.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

/// 读出定长字段中的字符串
pub fn read_cstr(src: &[u8]) -> &str {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_the_kernel_headers() {
        assert_eq!(size_of::<V4l2Capability>(), 104);
        assert_eq!(size_of::<V4l2FmtDesc>(), 64);
        assert_eq!(size_of::<V4l2PixFormat>(), 48);
        assert_eq!(size_of::<V4l2RequestBuffers>(), 20);
        assert_eq!(size_of::<V4l2StreamParm>(), 204);
        assert_eq!(size_of::<V4l2ExtControl>(), 20);
        assert_eq!(size_of::<V4l2QueryExtCtrl>(), 232);
        assert_eq!(size_of::<V4l2FrmSizeEnum>(), 44);
        assert_eq!(size_of::<V4l2QueryMenu>(), 44);
    }

    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    #[test]
    fn request_codes_match_linux_x86_64() {
        assert_eq!(size_of::<V4l2Format>(), 208);
        assert_eq!(size_of::<V4l2Buffer>(), 88);
        assert_eq!(VIDIOC_QUERYCAP, 0x8068_5600);
        assert_eq!(VIDIOC_S_FMT, 0xc0d0_5605);
        assert_eq!(VIDIOC_REQBUFS, 0xc014_5608);
        assert_eq!(VIDIOC_QBUF, 0xc058_560f);
        assert_eq!(VIDIOC_STREAMON, 0x4004_5612);
        assert_eq!(VIDIOC_S_EXT_CTRLS, 0xc020_5648);
        assert_eq!(VIDIOC_QUERY_EXT_CTRL, 0xc0e8_5667);
        assert_eq!(VIDIOC_QUERYMENU, 0xc02c_5625);
    }

    #[test]
    fn cstr_fields_are_nul_terminated() {
        let mut buf = [0xffu8; 8];
        copy_cstr(&mut buf, "/dev/video0");
        assert_eq!(&buf, b"/dev/vi\0");
        assert_eq!(read_cstr(&buf), "/dev/vi");
    }

    #[test]
    fn ext_control_value_is_the_low_word() {
        let mut ctrl = V4l2ExtControl::new(V4L2_CID_HFLIP, -3);
        assert_eq!(ctrl.value(), -3);
        ctrl.set_value(1);
        assert_eq!(ctrl.value(), 1);
    }
}
