//! 设备命名空间与文件句柄
//!
//! 设备以 `/dev/videoN` 的名字注册；`open` 按名字查找并打开，
//! 文件句柄 drop 时关闭设备。

use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use embvid_core::error::{Result, VideoError};
use embvid_core::format::SensorPort;

use crate::buffer::PayloadArena;
use crate::device::VideoDevice;
use crate::ioctl::unpack_offset;
use crate::registry;
use crate::uapi::{V4l2Buffer, V4L2_BUF_TYPE_VIDEO_CAPTURE};

pub const VIDEO_DEVICE_PREFIX: &str = "/dev/video";

/// 固定的设备号分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceSlot(pub u32);

impl DeviceSlot {
    pub const MIPI_CSI: Self = Self(0);
    /// ISP + DVP 组合采集
    pub const ISP_DVP: Self = Self(1);
    pub const DVP: Self = Self(2);
    pub const SPI_0: Self = Self(3);
    pub const SPI_1: Self = Self(4);
    pub const JPEG: Self = Self(10);
    pub const H264: Self = Self(11);
    /// ISP 第二路输出
    pub const ISP: Self = Self(20);
    pub const UVC_FIRST: Self = Self(40);
    pub const UVC_LAST: Self = Self(49);

    /// 第 n 个 USB UVC 采集设备 (0..=9)
    pub fn uvc(n: u32) -> Option<Self> {
        (n <= Self::UVC_LAST.0 - Self::UVC_FIRST.0).then(|| Self(Self::UVC_FIRST.0 + n))
    }

    /// 第 `instance` 个同类传感器接口对应的采集设备号
    ///
    /// CSI 与 DVP 各一路，SPI 两路；超出时返回 None。
    pub fn for_port(port: SensorPort, instance: u32) -> Option<Self> {
        match (port, instance) {
            (SensorPort::MipiCsi, 0) => Some(Self::MIPI_CSI),
            (SensorPort::Dvp, 0) => Some(Self::DVP),
            (SensorPort::Spi, n) if n <= Self::SPI_1.0 - Self::SPI_0.0 => Some(Self(Self::SPI_0.0 + n)),
            _ => None,
        }
    }

    pub fn name(self) -> String {
        device_name(self)
    }
}

impl fmt::Display for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", VIDEO_DEVICE_PREFIX, self.0)
    }
}

pub fn device_name(slot: DeviceSlot) -> String {
    slot.to_string()
}

/// 打开 `/dev/videoN` (或任意已注册的名字)
pub fn open(path: &str) -> Result<VideoFile> {
    let device = registry::find(path)
        .ok_or_else(|| VideoError::invalid_arg(format!("{path}: no such video device")))?;
    device.open()?;
    tracing::debug!(target: "embvid::v4l2", "{}: opened", path);
    Ok(VideoFile {
        device,
        timeout: Duration::MAX,
    })
}

/// 打开的设备文件
///
/// DQBUF 使用句柄上的超时，默认永久等待。
pub struct VideoFile {
    pub(crate) device: VideoDevice,
    pub(crate) timeout: Duration,
}

impl fmt::Debug for VideoFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFile")
            .field("device", &self.device.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl VideoFile {
    pub fn device(&self) -> &VideoDevice {
        &self.device
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// O_NONBLOCK：DQBUF 不等待
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.timeout = if nonblocking { Duration::ZERO } else { Duration::MAX };
    }

    /// 把 QUERYBUF 给出的 (offset, length) 翻译成载荷指针
    pub fn mmap(&self, offset: u32, length: u32) -> Result<NonNull<u8>> {
        let (type_, index) = unpack_offset(offset);
        if type_ != V4L2_BUF_TYPE_VIDEO_CAPTURE {
            return Err(VideoError::invalid_arg(format!(
                "{}: offset {offset:#010x} names buffer type {type_}",
                self.device.name()
            )));
        }

        let info = self.device.query_buffer(index as usize)?;
        if length > info.length {
            return Err(VideoError::invalid_arg(format!(
                "{}: mapping {length} bytes of a {} byte buffer",
                self.device.name(),
                info.length
            )));
        }
        self.device.payload(index as usize)
    }

    /// DQBUF 取回的缓冲的数据视图
    ///
    /// 只在缓冲由调用者持有时有效；视图存活期间该缓冲不能 QBUF，
    /// 同一个缓冲同时只能有一个视图。
    pub fn mapped(&self, buf: &V4l2Buffer) -> Result<MappedBuffer<'_>> {
        let index = buf.index as usize;
        let (arena, len) = self.device.lend_view(index)?;
        Ok(MappedBuffer {
            file: self,
            arena,
            index,
            len,
        })
    }
}

impl Drop for VideoFile {
    fn drop(&mut self) {
        if !self.device.is_registered() {
            return;
        }
        if let Err(e) = self.device.close() {
            tracing::debug!(target: "embvid::v4l2", "{}: close on drop: {}", self.device.name(), e);
        }
    }
}

/// 用户持有的一帧载荷
pub struct MappedBuffer<'a> {
    file: &'a VideoFile,
    arena: Arc<PayloadArena>,
    index: usize,
    len: usize,
}

impl fmt::Debug for MappedBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

impl Deref for MappedBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // 元素借出期间不会回到空闲链表，硬件不会写入
        unsafe { self.arena.slice(self.index, self.len) }
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        self.file.device.return_view(&self.arena, self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_follow_the_fixed_numbering() {
        assert_eq!(device_name(DeviceSlot::MIPI_CSI), "/dev/video0");
        assert_eq!(DeviceSlot::ISP_DVP.name(), "/dev/video1");
        assert_eq!(DeviceSlot::for_port(SensorPort::Dvp, 0), Some(DeviceSlot::DVP));
        assert_eq!(DeviceSlot::for_port(SensorPort::Dvp, 1), None);
        assert_eq!(DeviceSlot::for_port(SensorPort::MipiCsi, 0), Some(DeviceSlot::MIPI_CSI));
        assert_eq!(DeviceSlot::for_port(SensorPort::Spi, 0).map(DeviceSlot::name).as_deref(), Some("/dev/video3"));
        assert_eq!(DeviceSlot::for_port(SensorPort::Spi, 1), Some(DeviceSlot::SPI_1));
        assert_eq!(DeviceSlot::for_port(SensorPort::Spi, 2), None);
        assert_eq!(DeviceSlot::JPEG.name(), "/dev/video10");
        assert_eq!(DeviceSlot::H264.name(), "/dev/video11");
        assert_eq!(DeviceSlot::ISP.name(), "/dev/video20");
        assert_eq!(DeviceSlot::uvc(0), Some(DeviceSlot(40)));
        assert_eq!(DeviceSlot::uvc(9).map(DeviceSlot::name).as_deref(), Some("/dev/video49"));
        assert_eq!(DeviceSlot::uvc(10), None);
    }

    #[test]
    fn unknown_path_is_invalid_arg() {
        assert!(matches!(open("/dev/video99"), Err(VideoError::InvalidArg(_))));
    }
}
