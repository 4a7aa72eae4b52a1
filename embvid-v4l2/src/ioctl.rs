//! V4L2 ioctl 分发
//!
//! [`Ioctl`] 是类型化的请求；[`VideoFile::ioctl_raw`] 接受 Linux 请求码和裸指针，
//! 翻译成同样的分发。失败的请求不改变设备状态。

use std::ffi::c_void;

use bytemuck::Zeroable;

use embvid_core::error::{Result, VideoError};
use embvid_core::pixel_format::FourCC;

use crate::buffer::BufferState;
use crate::controls;
use crate::device::{BufferInfo, VideoDevice, VideoFormat};
use crate::pixel_map;
use crate::uapi::*;
use crate::vfs::VideoFile;

/// bus_info 的平台前缀
pub const BUS_PLATFORM: &str = "platform";

/// mmap offset 编码：高 8 位缓冲类型，低 24 位索引
pub const fn pack_offset(type_: u32, index: u32) -> u32 {
    (type_ << 24) | (index & 0x00ff_ffff)
}

pub const fn unpack_offset(offset: u32) -> (u32, u32) {
    (offset >> 24, offset & 0x00ff_ffff)
}

/// QUERYCAP 的 version 字段
pub fn kernel_version() -> u32 {
    let part = |s: &str| s.parse::<u32>().unwrap_or(0);
    let major = part(env!("CARGO_PKG_VERSION_MAJOR"));
    let minor = part(env!("CARGO_PKG_VERSION_MINOR"));
    let patch = part(env!("CARGO_PKG_VERSION_PATCH"));
    (major << 16) | (minor << 8) | patch
}

/// 类型化的 ioctl 请求
#[derive(Debug)]
pub enum Ioctl<'a> {
    QueryCap(&'a mut V4l2Capability),
    EnumFmt(&'a mut V4l2FmtDesc),
    GetFmt(&'a mut V4l2Format),
    SetFmt(&'a mut V4l2Format),
    TryFmt(&'a mut V4l2Format),
    EnumFrameSizes(&'a mut V4l2FrmSizeEnum),
    ReqBufs(&'a mut V4l2RequestBuffers),
    QueryBuf(&'a mut V4l2Buffer),
    /// 私有请求码：offset → 载荷指针
    Mmap(&'a mut MmapRequest),
    QBuf(&'a mut V4l2Buffer),
    DQBuf(&'a mut V4l2Buffer),
    StreamOn(u32),
    StreamOff(u32),
    GetParm(&'a mut V4l2StreamParm),
    SetParm(&'a mut V4l2StreamParm),
    GetExtCtrls {
        controls: &'a mut [V4l2ExtControl],
        error_idx: &'a mut u32,
    },
    SetExtCtrls {
        controls: &'a mut [V4l2ExtControl],
        error_idx: &'a mut u32,
    },
    QueryExtCtrl(&'a mut V4l2QueryExtCtrl),
    QueryMenu(&'a mut V4l2QueryMenu),
}

fn check_type(dev: &VideoDevice, type_: u32) -> Result<()> {
    if type_ == V4L2_BUF_TYPE_VIDEO_CAPTURE {
        Ok(())
    } else {
        Err(VideoError::invalid_arg(format!("{}: unsupported buffer type {type_}", dev.name())))
    }
}

fn check_memory(dev: &VideoDevice, memory: u32) -> Result<()> {
    if memory == V4L2_MEMORY_MMAP {
        Ok(())
    } else {
        Err(VideoError::invalid_arg(format!("{}: only MMAP memory is supported (got {memory})", dev.name())))
    }
}

fn fill_format(fmt: &mut V4l2Format, format: &VideoFormat) {
    fmt.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
    fmt.fmt = V4l2FormatUnion::zeroed();
    let pix = &mut fmt.fmt.pix;
    pix.width = format.width;
    pix.height = format.height;
    pix.pixelformat = format.pixel_format.0;
    pix.bytesperline = format.bytes_per_line;
    pix.sizeimage = format.size_image;
    pix.field = V4L2_FIELD_NONE;
    pix.colorspace = pixel_map::colorspace(format.pixel_format);
}

fn fill_buffer(buf: &mut V4l2Buffer, info: &BufferInfo) {
    let index = info.index;
    *buf = V4l2Buffer::capture(index);
    buf.length = info.length;
    buf.bytesused = info.bytes_used;
    buf.field = V4L2_FIELD_NONE;
    buf.set_offset(pack_offset(V4L2_BUF_TYPE_VIDEO_CAPTURE, index));
    buf.flags = V4L2_BUF_FLAG_MAPPED
        | match info.state {
            BufferState::Free | BufferState::Hardware => V4L2_BUF_FLAG_QUEUED,
            BufferState::Done => V4L2_BUF_FLAG_DONE,
            BufferState::User => 0,
        };
}

fn fill_parm(parm: &mut V4l2StreamParm, fps: u32) {
    parm.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
    parm.parm = V4l2StreamParmUnion::zeroed();
    parm.parm.capture.capability = V4L2_CAP_TIMEPERFRAME;
    parm.parm.capture.timeperframe = V4l2Fract {
        numerator: 1,
        denominator: fps,
    };
}

impl VideoFile {
    /// 执行一个类型化的 ioctl
    pub fn ioctl(&mut self, request: Ioctl<'_>) -> Result<()> {
        let dev = &self.device;
        match request {
            Ioctl::QueryCap(cap) => {
                *cap = V4l2Capability::zeroed();
                copy_cstr(&mut cap.driver, dev.name());
                copy_cstr(&mut cap.card, dev.name());
                copy_cstr(&mut cap.bus_info, &format!("{BUS_PLATFORM}:{}", dev.name()));
                cap.version = kernel_version();
                let caps = dev.caps();
                cap.capabilities = caps.bits();
                if caps.contains(V4l2Caps::DEVICE_CAPS) {
                    cap.device_caps = (caps - V4l2Caps::DEVICE_CAPS).bits();
                }
                Ok(())
            }

            Ioctl::EnumFmt(desc) => {
                check_type(dev, desc.type_)?;
                let sensor_fmt = dev.enum_format(desc.index as usize)?;
                let (index, type_) = (desc.index, desc.type_);
                *desc = V4l2FmtDesc::zeroed();
                desc.index = index;
                desc.type_ = type_;
                desc.pixelformat = sensor_fmt.fourcc().0;
                copy_cstr(&mut desc.description, pixel_map::description(sensor_fmt.fourcc()));
                Ok(())
            }

            Ioctl::GetFmt(fmt) => {
                check_type(dev, fmt.type_)?;
                let format = dev.format()?;
                fill_format(fmt, &format);
                Ok(())
            }

            Ioctl::SetFmt(fmt) => {
                check_type(dev, fmt.type_)?;
                let pix = fmt.fmt.pix;
                let format = dev.set_format(pix.width, pix.height, FourCC(pix.pixelformat))?;
                fill_format(fmt, &format);
                Ok(())
            }

            Ioctl::TryFmt(fmt) => {
                check_type(dev, fmt.type_)?;
                let pix = fmt.fmt.pix;
                let format = dev.try_format(pix.width, pix.height, FourCC(pix.pixelformat))?;
                fill_format(fmt, &format);
                Ok(())
            }

            Ioctl::EnumFrameSizes(fs) => {
                let sizes = dev.frame_sizes(FourCC(fs.pixel_format))?;
                let (width, height) = *sizes.get(fs.index as usize).ok_or_else(|| {
                    VideoError::invalid_arg(format!("{}: frame size index {} out of range", dev.name(), fs.index))
                })?;
                let (index, pixel_format) = (fs.index, fs.pixel_format);
                *fs = V4l2FrmSizeEnum::zeroed();
                fs.index = index;
                fs.pixel_format = pixel_format;
                fs.type_ = V4L2_FRMSIZE_TYPE_DISCRETE;
                fs.discrete = V4l2FrmSizeDiscrete { width, height };
                Ok(())
            }

            Ioctl::ReqBufs(req) => {
                check_type(dev, req.type_)?;
                check_memory(dev, req.memory)?;
                req.count = dev.request_buffers(req.count)?;
                req.capabilities = V4L2_BUF_CAP_SUPPORTS_MMAP;
                Ok(())
            }

            Ioctl::QueryBuf(buf) => {
                check_type(dev, buf.type_)?;
                check_memory(dev, buf.memory)?;
                let info = dev.query_buffer(buf.index as usize)?;
                fill_buffer(buf, &info);
                Ok(())
            }

            Ioctl::Mmap(req) => {
                let ptr = self.mmap(req.offset, req.length)?;
                req.mapped_ptr = ptr.as_ptr().cast();
                Ok(())
            }

            Ioctl::QBuf(buf) => {
                check_type(dev, buf.type_)?;
                check_memory(dev, buf.memory)?;
                dev.queue_buffer(buf.index as usize)?;
                buf.flags = (buf.flags | V4L2_BUF_FLAG_QUEUED | V4L2_BUF_FLAG_MAPPED) & !V4L2_BUF_FLAG_DONE;
                Ok(())
            }

            Ioctl::DQBuf(buf) => {
                check_type(dev, buf.type_)?;
                check_memory(dev, buf.memory)?;
                let done = dev.dequeue(self.timeout)?;
                let length = dev.buffers().map_or(0, |(_, capacity)| capacity as u32);
                let index = done.index as u32;

                *buf = V4l2Buffer::capture(index);
                buf.bytesused = done.bytes_used as u32;
                buf.flags = V4L2_BUF_FLAG_DONE | V4L2_BUF_FLAG_MAPPED | V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC;
                buf.field = V4L2_FIELD_NONE;
                buf.sequence = done.sequence;
                buf.timestamp = Timeval {
                    tv_sec: done.timestamp.as_secs() as libc::c_long,
                    tv_usec: done.timestamp.subsec_micros() as libc::c_long,
                };
                buf.length = length;
                buf.set_offset(pack_offset(V4L2_BUF_TYPE_VIDEO_CAPTURE, index));
                Ok(())
            }

            Ioctl::StreamOn(type_) => {
                check_type(dev, type_)?;
                dev.stream_on()
            }

            Ioctl::StreamOff(type_) => {
                check_type(dev, type_)?;
                dev.stream_off()
            }

            Ioctl::GetParm(parm) => {
                check_type(dev, parm.type_)?;
                let fps = dev.fps()?;
                fill_parm(parm, fps);
                Ok(())
            }

            Ioctl::SetParm(parm) => {
                check_type(dev, parm.type_)?;
                let tpf = parm.parm.capture.timeperframe;
                if tpf.numerator != 1 {
                    return Err(VideoError::invalid_arg(format!(
                        "{}: time per frame must be 1/fps (got {}/{})",
                        dev.name(),
                        tpf.numerator,
                        tpf.denominator
                    )));
                }
                let fps = dev.set_fps(tpf.denominator)?;
                fill_parm(parm, fps);
                Ok(())
            }

            Ioctl::GetExtCtrls { controls, error_idx } => controls::get_ext_ctrls(dev, controls, error_idx),

            Ioctl::SetExtCtrls { controls, error_idx } => controls::set_ext_ctrls(dev, controls, error_idx),

            Ioctl::QueryExtCtrl(query) => controls::query_ext_ctrl(dev, query),

            Ioctl::QueryMenu(menu) => controls::query_menu(dev, menu),
        }
    }

    /// 以 Linux 请求码和参数指针执行 ioctl
    ///
    /// # Safety
    /// `arg` 必须指向与 `request` 编码一致、可读写的结构体；
    /// 对于 EXT_CTRLS，`controls` 必须指向 `count` 个有效元素。
    pub unsafe fn ioctl_raw(&mut self, request: u32, arg: *mut c_void) -> Result<()> {
        if arg.is_null() {
            return Err(VideoError::invalid_arg(format!("{}: null ioctl argument", self.device.name())));
        }

        let request = match request {
            VIDIOC_QUERYCAP => Ioctl::QueryCap(&mut *arg.cast()),
            VIDIOC_ENUM_FMT => Ioctl::EnumFmt(&mut *arg.cast()),
            VIDIOC_G_FMT => Ioctl::GetFmt(&mut *arg.cast()),
            VIDIOC_S_FMT => Ioctl::SetFmt(&mut *arg.cast()),
            VIDIOC_TRY_FMT => Ioctl::TryFmt(&mut *arg.cast()),
            VIDIOC_ENUM_FRAMESIZES => Ioctl::EnumFrameSizes(&mut *arg.cast()),
            VIDIOC_REQBUFS => Ioctl::ReqBufs(&mut *arg.cast()),
            VIDIOC_QUERYBUF => Ioctl::QueryBuf(&mut *arg.cast()),
            VIDIOC_MMAP => Ioctl::Mmap(&mut *arg.cast()),
            VIDIOC_QBUF => Ioctl::QBuf(&mut *arg.cast()),
            VIDIOC_DQBUF => Ioctl::DQBuf(&mut *arg.cast()),
            VIDIOC_STREAMON => Ioctl::StreamOn(*arg.cast::<i32>() as u32),
            VIDIOC_STREAMOFF => Ioctl::StreamOff(*arg.cast::<i32>() as u32),
            VIDIOC_G_PARM => Ioctl::GetParm(&mut *arg.cast()),
            VIDIOC_S_PARM => Ioctl::SetParm(&mut *arg.cast()),
            VIDIOC_QUERY_EXT_CTRL => Ioctl::QueryExtCtrl(&mut *arg.cast()),
            VIDIOC_QUERYMENU => Ioctl::QueryMenu(&mut *arg.cast()),
            VIDIOC_G_EXT_CTRLS | VIDIOC_S_EXT_CTRLS => {
                let ctrls = &mut *arg.cast::<V4l2ExtControls>();
                let controls: &mut [V4l2ExtControl] = if ctrls.count == 0 {
                    &mut []
                } else if ctrls.controls.is_null() {
                    return Err(VideoError::invalid_arg(format!("{}: null control array", self.device.name())));
                } else {
                    std::slice::from_raw_parts_mut(ctrls.controls, ctrls.count as usize)
                };
                let error_idx = &mut ctrls.error_idx;
                if request == VIDIOC_G_EXT_CTRLS {
                    Ioctl::GetExtCtrls { controls, error_idx }
                } else {
                    Ioctl::SetExtCtrls { controls, error_idx }
                }
            }
            _ => {
                return Err(VideoError::not_supported(format!(
                    "{}: ioctl {request:#010x}",
                    self.device.name()
                )))
            }
        };
        self.ioctl(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_injective() {
        for index in [0, 1, 7, 0x00ff_ffff] {
            let off = pack_offset(V4L2_BUF_TYPE_VIDEO_CAPTURE, index);
            assert_eq!(unpack_offset(off), (V4L2_BUF_TYPE_VIDEO_CAPTURE, index));
        }
        assert_eq!(pack_offset(1, 3), 0x0100_0003);
        assert_ne!(pack_offset(1, 3), pack_offset(2, 3));
    }

    #[test]
    fn version_packs_semver() {
        let v = kernel_version();
        assert_eq!(v >> 16, env!("CARGO_PKG_VERSION_MAJOR").parse::<u32>().unwrap());
        assert_eq!((v >> 8) & 0xff, env!("CARGO_PKG_VERSION_MINOR").parse::<u32>().unwrap());
    }
}
