//! 数据面：底层采集接口、硬件侧的缓冲句柄、读者侧的完成帧

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use embvid_core::error::Result;
use embvid_core::frame::Frame;

use crate::buffer::PayloadArena;
use crate::device::{Shared, VideoDevice, VideoFormat};

/// 底层采集接口 (DVP / MIPI-CSI / SPI 控制器驱动)
///
/// 由设备在控制路径上调用，调用期间持有设备的控制锁。
pub trait CaptureInterface: Send {
    /// 接口描述 (e.g. "DVP")
    fn name(&self) -> &str;

    /// open 时调用
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// close 时调用
    fn deinit(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_format(&mut self, format: &VideoFormat) -> Result<()>;

    /// 开始采集：之后通过 `sink` 取缓冲、报告完成
    fn start_capture(&mut self, sink: FrameSink, format: &VideoFormat, fps: u32) -> Result<()>;

    /// 停止采集；返回时不得再调用 sink
    fn stop_capture(&mut self) -> Result<()>;
}

impl<T: CaptureInterface + ?Sized> CaptureInterface for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn init(&mut self) -> Result<()> {
        (**self).init()
    }

    fn deinit(&mut self) -> Result<()> {
        (**self).deinit()
    }

    fn set_format(&mut self, format: &VideoFormat) -> Result<()> {
        (**self).set_format(format)
    }

    fn start_capture(&mut self, sink: FrameSink, format: &VideoFormat, fps: u32) -> Result<()> {
        (**self).start_capture(sink, format, fps)
    }

    fn stop_capture(&mut self) -> Result<()> {
        (**self).stop_capture()
    }
}

/// 硬件侧 (ISR / DMA 上下文) 的设备句柄
///
/// 只暴露取缓冲与完成回调，不经过控制锁。
#[derive(Clone)]
pub struct FrameSink {
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink").field("device", &self.shared.name).finish()
    }
}

impl FrameSink {
    pub fn device_name(&self) -> &str {
        &self.shared.name
    }

    /// 当前缓冲池的单元素容量 (尚未申请缓冲时为 0)
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.accepting()
    }

    /// 为下一帧取一个空闲缓冲
    ///
    /// 池空或未在采集时返回 None，这一帧被丢弃 (计入丢帧)。
    pub fn alloc_buffer(&self) -> Option<DmaBuffer> {
        self.shared.alloc_buffer()
    }

    /// 完成回调：缓冲进入完成队列，唤醒读者
    ///
    /// # Panics
    /// `size` 超过缓冲容量时 panic (池的尺寸小于传感器的最大帧)。
    pub fn recv_done(&self, mut buf: DmaBuffer, size: usize) {
        buf.armed = false;
        self.shared.recv_done(buf.index, buf.epoch, &buf.arena, size);
    }

    /// 以载荷指针报告完成 (配合 [`DmaBuffer::into_raw`])
    ///
    /// 指针不属于本设备的缓冲池时返回 `InvalidArg`。
    ///
    /// # Panics
    /// 同 [`FrameSink::recv_done`]。
    pub fn recv_done_ptr(&self, payload: NonNull<u8>, size: usize) -> Result<()> {
        self.shared.recv_done_ptr(payload.as_ptr(), size)
    }
}

/// 硬件持有的缓冲
///
/// 没有报告完成就被丢弃时自动回到空闲链表。
pub struct DmaBuffer {
    pub(crate) shared: Arc<Shared>,
    pub(crate) arena: Arc<PayloadArena>,
    pub(crate) index: usize,
    pub(crate) epoch: u32,
    pub(crate) armed: bool,
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("index", &self.index)
            .field("epoch", &self.epoch)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl DmaBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.arena.stride()
    }

    /// DMA 目标地址
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.arena.payload(self.index)
    }

    /// 以 CPU 写入 (仿真 / 软件拷贝)
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // 硬件态的元素只有这个句柄能访问
        unsafe { self.arena.slice_mut(self.index) }
    }

    /// 放弃 RAII 回收，交出裸指针；之后必须用 `recv_done_ptr` 报告
    pub fn into_raw(mut self) -> NonNull<u8> {
        self.armed = false;
        self.as_ptr()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if self.armed {
            self.shared.return_unfilled(self.index, self.epoch, &self.arena);
        }
    }
}

/// 从完成队列取出的缓冲 (读者持有，直到 release / QBUF)
#[derive(Debug, Clone, Copy)]
pub struct CompletedBuffer {
    pub index: usize,
    pub bytes_used: usize,
    pub sequence: u32,
    pub timestamp: Duration,
    pub(crate) payload: NonNull<u8>,
}

// payload 只是池内地址；访问权由池状态 (User) 保证
unsafe impl Send for CompletedBuffer {}

impl CompletedBuffer {
    pub fn payload(&self) -> NonNull<u8> {
        self.payload
    }
}

/// 一帧的借用视图，drop 时自动归还缓冲
///
/// 存活期间元素处于借出状态，QBUF / release 返回 `InvalidState`。
pub struct FrameGuard<'a> {
    pub(crate) device: &'a VideoDevice,
    pub(crate) arena: Arc<PayloadArena>,
    pub(crate) buf: CompletedBuffer,
    pub(crate) format: VideoFormat,
}

impl fmt::Debug for FrameGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameGuard")
            .field("device", &self.device.name())
            .field("buffer", &self.buf)
            .finish()
    }
}

impl FrameGuard<'_> {
    pub fn buffer(&self) -> &CompletedBuffer {
        &self.buf
    }

    pub fn data(&self) -> &[u8] {
        // 借出的元素在本 guard 存活期间不会回到空闲链表
        unsafe { self.arena.slice(self.buf.index, self.buf.bytes_used) }
    }

    pub fn frame(&self) -> Frame<'_> {
        Frame {
            data: self.data(),
            width: self.format.width,
            height: self.format.height,
            stride: self.format.bytes_per_line as usize,
            format: self.format.pixel_format,
            sequence: self.buf.sequence,
            timestamp: self.buf.timestamp,
            index: self.buf.index,
        }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.device.release_from_guard(&self.arena, self.buf.index);
    }
}
