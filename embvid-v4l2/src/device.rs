//! 视频设备核心
//!
//! 一个设备 = 名字 + 传感器 + 底层采集接口 + 缓冲池 + 完成队列。
//! 控制路径 (格式、缓冲申请、启停) 走 `std::sync::Mutex`；
//! 数据路径 (取缓冲、完成、出队) 只碰一把短自旋锁和计数信号量。

use std::collections::VecDeque;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use embvid_core::error::{Result, VideoError};
use embvid_core::format::SensorFormat;
use embvid_core::param::{ParamDesc, ParamId};
use embvid_core::pixel_format::{FourCC, SensorPixelFormat};
use embvid_core::sensor::{IoctlReply, SensorIoctl};
use embvid_core::telemetry::DeviceTelemetry;
use embvid_core::time::monotonic;
use embvid_core::traits::CameraSensor;

use crate::buffer::{BufferState, FramePool, PayloadArena, PoolCensus};
use crate::registry;
use crate::stream::{CaptureInterface, CompletedBuffer, DmaBuffer, FrameGuard, FrameSink};
use crate::sync::Semaphore;
use crate::uapi::V4l2Caps;

/// 默认缓冲个数上限
pub const DEFAULT_MAX_BUFFERS: u32 = 8;

/// 设备状态机
///
/// `Unopened → Opened → Configured ⇄ Streaming`，任意状态 close 回到 `Unopened`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
#[repr(u8)]
pub enum DeviceState {
    Unopened = 0,
    Opened = 1,
    Configured = 2,
    Streaming = 3,
}

impl DeviceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Opened,
            2 => Self::Configured,
            3 => Self::Streaming,
            _ => Self::Unopened,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unopened => "UNOPENED",
            Self::Opened => "OPENED",
            Self::Configured => "CONFIGURED",
            Self::Streaming => "STREAMING",
        })
    }
}

/// 设备当前的输出格式 (G_FMT 的内容)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: FourCC,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

impl VideoFormat {
    pub fn new(width: u32, height: u32, format: SensorPixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format: format.fourcc(),
            bytes_per_line: format.bytes_per_line(width),
            size_image: format.image_size(width, height),
        }
    }

    pub fn from_sensor(desc: &SensorFormat) -> Self {
        Self::new(desc.width, desc.height, desc.pixel_format)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.pixel_format)
    }
}

/// `VideoDevice::create` 的参数
pub struct VideoDeviceConfig {
    pub name: String,
    /// REQBUFS 的个数上限 (也是信号量上限)
    pub max_buffers: u32,
    /// 单个缓冲的最小容量；实际容量取它与当前格式 sizeimage 的较大者
    pub buffer_capacity: usize,
    pub caps: V4l2Caps,
    pub capture: Box<dyn CaptureInterface>,
    pub sensor: Option<Box<dyn CameraSensor>>,
}

impl fmt::Debug for VideoDeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoDeviceConfig")
            .field("name", &self.name)
            .field("max_buffers", &self.max_buffers)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("caps", &self.caps)
            .field("capture", &self.capture.name())
            .field("sensor", &self.sensor.as_ref().map(|s| s.name()))
            .finish()
    }
}

impl VideoDeviceConfig {
    pub fn new(name: impl Into<String>, capture: impl CaptureInterface + 'static) -> Self {
        Self {
            name: name.into(),
            max_buffers: DEFAULT_MAX_BUFFERS,
            buffer_capacity: 0,
            caps: V4l2Caps::VIDEO_CAPTURE | V4l2Caps::STREAMING,
            capture: Box::new(capture),
            sensor: None,
        }
    }

    pub fn sensor(mut self, sensor: Box<dyn CameraSensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn max_buffers(mut self, count: u32) -> Self {
        self.max_buffers = count;
        self
    }

    pub fn buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = bytes;
        self
    }

    pub fn caps(mut self, caps: V4l2Caps) -> Self {
        self.caps = caps;
        self
    }
}

/// 缓冲查询结果 (QUERYBUF)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub length: u32,
    pub bytes_used: u32,
    pub state: BufferState,
}

// --- 内部状态 ---

struct Control {
    state: DeviceState,
    sensor: Option<Box<dyn CameraSensor>>,
    capture: Box<dyn CaptureInterface>,
    format: VideoFormat,
    fps: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct FrameMeta {
    sequence: u32,
    timestamp: Duration,
}

/// 自旋锁保护的数据面状态
struct Queues {
    pool: Option<FramePool>,
    done: VecDeque<usize>,
    meta: Vec<FrameMeta>,
    /// 每次停流 / 重建池递增，旧的 DmaBuffer 据此识别为过期
    epoch: u32,
    accepting: bool,
    sequence: u32,
    format: VideoFormat,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    dropped: AtomicU64,
    stale: AtomicU64,
    dequeued: AtomicU64,
    timeouts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) struct Shared {
    pub(crate) name: String,
    caps: V4l2Caps,
    max_buffers: u32,
    min_capacity: usize,
    pub(crate) registered: AtomicBool,
    state: AtomicU8,
    control: Mutex<Control>,
    queues: spin::Mutex<Queues>,
    sem: Semaphore,
    counters: Counters,
}

impl Shared {
    pub(crate) fn capacity(&self) -> usize {
        self.queues.lock().pool.as_ref().map_or(0, FramePool::capacity)
    }

    pub(crate) fn accepting(&self) -> bool {
        self.queues.lock().accepting
    }

    pub(crate) fn alloc_buffer(self: &Arc<Self>) -> Option<DmaBuffer> {
        let mut q = self.queues.lock();
        if !q.accepting {
            return None;
        }
        let epoch = q.epoch;
        let pool = q.pool.as_mut()?;

        match pool.alloc() {
            Some(index) => Some(DmaBuffer {
                shared: Arc::clone(self),
                arena: Arc::clone(pool.arena()),
                index,
                epoch,
                armed: true,
            }),
            None => {
                drop(q);
                bump(&self.counters.dropped);
                tracing::trace!(target: "embvid::video", "{}: no free buffer, frame dropped", self.name);
                None
            }
        }
    }

    pub(crate) fn recv_done(&self, index: usize, epoch: u32, arena: &Arc<PayloadArena>, size: usize) {
        let capacity = arena.stride();
        assert!(
            size <= capacity,
            "frame buffer overflow: completion of {size} bytes into buffer {index} of {capacity} bytes"
        );

        let mut q = self.queues.lock();
        let current = q.epoch == epoch && q.pool.as_ref().is_some_and(|p| Arc::ptr_eq(p.arena(), arena));
        if !current {
            drop(q);
            self.stale_completion(index);
            return;
        }

        Self::complete_locked(&mut q, index, size);
        drop(q);
        self.signal_done();
    }

    pub(crate) fn recv_done_ptr(&self, ptr: *const u8, size: usize) -> Result<()> {
        let mut q = self.queues.lock();
        let pool = q
            .pool
            .as_ref()
            .ok_or_else(|| VideoError::invalid_state(format!("{}: no buffers requested", self.name)))?;
        let index = pool
            .index_of(ptr)
            .ok_or_else(|| VideoError::invalid_arg(format!("{}: {ptr:p} is not a payload of this pool", self.name)))?;

        // 停流时已被收回的元素
        if pool.state(index) != BufferState::Hardware {
            drop(q);
            self.stale_completion(index);
            return Ok(());
        }

        Self::complete_locked(&mut q, index, size);
        drop(q);
        self.signal_done();
        Ok(())
    }

    /// 硬件没用上的缓冲回到空闲链表
    pub(crate) fn return_unfilled(&self, index: usize, epoch: u32, arena: &Arc<PayloadArena>) {
        let mut q = self.queues.lock();
        if q.epoch != epoch {
            return;
        }
        if let Some(pool) = q.pool.as_mut() {
            if Arc::ptr_eq(pool.arena(), arena) && pool.state(index) == BufferState::Hardware {
                pool.free(index);
            }
        }
    }

    fn complete_locked(q: &mut Queues, index: usize, size: usize) {
        let Queues {
            pool,
            done,
            meta,
            sequence,
            ..
        } = q;
        if let Some(pool) = pool.as_mut() {
            pool.complete(index, size);
        }
        meta[index] = FrameMeta {
            sequence: *sequence,
            timestamp: monotonic(),
        };
        *sequence = sequence.wrapping_add(1);
        done.push_back(index);
    }

    fn signal_done(&self) {
        let given = self.sem.give();
        debug_assert!(given, "completion semaphore saturated");
        bump(&self.counters.completed);
    }

    fn stale_completion(&self, index: usize) {
        bump(&self.counters.stale);
        tracing::warn!(target: "embvid::video", "{}: discarded late completion of buffer {}", self.name, index);
    }

    /// 停止接收，收回硬件持有的元素，把完成队列排空回空闲链表
    fn quiesce(&self) -> (usize, usize) {
        let reclaimed = {
            let mut q = self.queues.lock();
            q.accepting = false;
            q.epoch = q.epoch.wrapping_add(1);
            q.pool.as_mut().map_or(0, FramePool::reclaim_hardware)
        };

        let mut drained = 0;
        // 先拿许可再出队，保持信号量与队列长度一致
        while self.sem.try_take() {
            let mut q = self.queues.lock();
            let Queues { pool, done, .. } = &mut *q;
            if let (Some(pool), Some(index)) = (pool.as_mut(), done.pop_front()) {
                pool.free(index);
                drained += 1;
            }
        }
        (reclaimed, drained)
    }
}

/// 视频设备句柄
///
/// 克隆得到的句柄指向同一个设备；设备在 [`VideoDevice::destroy`] 之前一直留在注册表中。
#[derive(Clone)]
pub struct VideoDevice {
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for VideoDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoDevice")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl VideoDevice {
    /// 创建并注册设备；名字冲突返回 `InvalidArg`
    pub fn create(config: VideoDeviceConfig) -> Result<Self> {
        let VideoDeviceConfig {
            name,
            max_buffers,
            buffer_capacity,
            caps,
            capture,
            sensor,
        } = config;

        if name.is_empty() {
            return Err(VideoError::invalid_arg("video device needs a name"));
        }
        if max_buffers == 0 {
            return Err(VideoError::invalid_arg(format!("{name}: max_buffers must be > 0")));
        }

        let (format, fps) = sensor
            .as_deref()
            .and_then(|s| s.format().or_else(|| s.formats().next()))
            .map(|desc| (VideoFormat::from_sensor(desc), desc.fps))
            .unwrap_or_default();

        let shared = Arc::new(Shared {
            name,
            caps,
            max_buffers,
            min_capacity: buffer_capacity,
            registered: AtomicBool::new(false),
            state: AtomicU8::new(DeviceState::Unopened as u8),
            control: Mutex::new(Control {
                state: DeviceState::Unopened,
                sensor,
                capture,
                format,
                fps,
            }),
            queues: spin::Mutex::new(Queues {
                pool: None,
                done: VecDeque::new(),
                meta: Vec::new(),
                epoch: 0,
                accepting: false,
                sequence: 0,
                format,
            }),
            sem: Semaphore::new(max_buffers),
            counters: Counters::default(),
        });

        if let Err(e) = registry::insert(&shared) {
            // 传感器归我们所有，注册失败也要按顺序断电
            let sensor = shared.control.lock().unwrap_or_else(PoisonError::into_inner).sensor.take();
            if let Some(sensor) = sensor {
                if let Err(err) = sensor.delete() {
                    tracing::warn!(target: "embvid::video", "{}: sensor delete failed: {}", shared.name, err);
                }
            }
            return Err(e);
        }

        tracing::info!(
            target: "embvid::video",
            "Registered video device {} ({} buffers max, format {} @ {} fps)",
            shared.name,
            max_buffers,
            format,
            fps
        );
        Ok(Self { shared })
    }

    /// 关闭 (如有必要)、注销并释放设备
    pub fn destroy(&self) -> Result<()> {
        let mut guard = self.control()?;
        let ctl = &mut *guard;
        if ctl.state != DeviceState::Unopened {
            self.close_locked(ctl);
        }

        registry::remove(&self.shared);
        debug_assert_eq!(self.shared.sem.value(), 0);
        {
            let mut q = self.shared.queues.lock();
            debug_assert!(q.done.is_empty(), "completion queue not empty on destroy");
            q.pool = None;
            q.done.clear();
        }

        tracing::info!(target: "embvid::video", "Destroyed video device {}", self.shared.name);
        match ctl.sensor.take() {
            Some(sensor) => sensor.delete(),
            None => Ok(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::Acquire)
    }

    pub fn caps(&self) -> V4l2Caps {
        self.shared.caps
    }

    pub fn max_buffers(&self) -> u32 {
        self.shared.max_buffers
    }

    fn ensure_registered(&self) -> Result<()> {
        if self.is_registered() {
            Ok(())
        } else {
            Err(VideoError::invalid_arg(format!("{}: device has been destroyed", self.shared.name)))
        }
    }

    fn ensure_open(&self) -> Result<()> {
        self.ensure_registered()?;
        if self.state() == DeviceState::Unopened {
            return Err(VideoError::invalid_state(format!("{}: device is not open", self.shared.name)));
        }
        Ok(())
    }

    fn control(&self) -> Result<MutexGuard<'_, Control>> {
        self.ensure_registered()?;
        Ok(self.shared.control.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// 取控制锁并要求设备已打开
    fn opened(&self) -> Result<MutexGuard<'_, Control>> {
        let guard = self.control()?;
        if guard.state == DeviceState::Unopened {
            return Err(VideoError::invalid_state(format!("{}: device is not open", self.shared.name)));
        }
        Ok(guard)
    }

    fn set_state(&self, ctl: &mut Control, state: DeviceState) {
        if ctl.state != state {
            tracing::debug!(target: "embvid::video", "{}: {} -> {}", self.shared.name, ctl.state, state);
        }
        ctl.state = state;
        self.shared.state.store(state as u8, Ordering::Release);
    }

    // --- 打开 / 关闭 ---

    pub fn open(&self) -> Result<()> {
        let mut guard = self.control()?;
        let ctl = &mut *guard;
        if ctl.state != DeviceState::Unopened {
            return Err(VideoError::invalid_state(format!("{}: device is already open", self.shared.name)));
        }

        ctl.capture.init()?;
        if let Err(e) = self.prepare_sensor(ctl) {
            if let Err(err) = ctl.capture.deinit() {
                tracing::warn!(target: "embvid::video", "{}: capture deinit failed: {}", self.shared.name, err);
            }
            return Err(e);
        }

        self.set_state(ctl, DeviceState::Opened);
        Ok(())
    }

    /// 传感器还没有格式时写入默认格式，并同步到底层接口
    fn prepare_sensor(&self, ctl: &mut Control) -> Result<()> {
        if let Some(sensor) = ctl.sensor.as_mut() {
            if sensor.format().is_none() {
                sensor.set_format(None)?;
            }
            if let Some(desc) = sensor.format() {
                ctl.format = VideoFormat::from_sensor(desc);
                ctl.fps = desc.fps;
            }
        }

        if !ctl.format.is_empty() {
            ctl.capture.set_format(&ctl.format)?;
        }
        self.shared.queues.lock().format = ctl.format;
        Ok(())
    }

    /// 关闭设备；正在采集时先停流
    pub fn close(&self) -> Result<()> {
        let mut guard = self.opened()?;
        self.close_locked(&mut guard);
        Ok(())
    }

    fn close_locked(&self, ctl: &mut Control) {
        if ctl.state == DeviceState::Streaming {
            self.stream_off_locked(ctl);
        }
        if let Err(e) = ctl.capture.deinit() {
            tracing::warn!(target: "embvid::video", "{}: capture deinit failed: {}", self.shared.name, e);
        }

        while self.shared.sem.try_take() {}
        {
            let mut q = self.shared.queues.lock();
            q.pool = None;
            q.done.clear();
            q.meta.clear();
            q.epoch = q.epoch.wrapping_add(1);
        }

        self.set_state(ctl, DeviceState::Unopened);
        tracing::info!(target: "embvid::video", "{}: closed", self.shared.name);
    }

    // --- 格式 ---

    pub fn format(&self) -> Result<VideoFormat> {
        Ok(self.opened()?.format)
    }

    pub fn fps(&self) -> Result<u32> {
        Ok(self.opened()?.fps)
    }

    /// 第 index 个传感器格式 (ENUM_FMT)
    pub fn enum_format(&self, index: usize) -> Result<&'static SensorFormat> {
        let guard = self.opened()?;
        let sensor = sensor_ref(&guard, &self.shared.name)?;
        sensor.formats().nth(index).ok_or_else(|| {
            VideoError::invalid_arg(format!("{}: format index {index} out of range", self.shared.name))
        })
    }

    /// 某个 FourCC 的离散分辨率 (ENUM_FRAMESIZES)
    pub fn frame_sizes(&self, fourcc: FourCC) -> Result<Vec<(u32, u32)>> {
        let guard = self.opened()?;
        let sensor = sensor_ref(&guard, &self.shared.name)?;
        let mut sizes: Vec<(u32, u32)> = Vec::new();
        for desc in sensor.formats().filter(|f| f.fourcc() == fourcc) {
            if !sizes.contains(&(desc.width, desc.height)) {
                sizes.push((desc.width, desc.height));
            }
        }
        Ok(sizes)
    }

    /// 只校验，不改变任何状态 (TRY_FMT)
    pub fn try_format(&self, width: u32, height: u32, fourcc: FourCC) -> Result<VideoFormat> {
        let guard = self.opened()?;
        let (format, _, _) = self.resolve_format(&guard, width, height, fourcc)?;
        Ok(format)
    }

    /// 选择与 (width, height, fourcc) 匹配的传感器格式并应用 (S_FMT)
    pub fn set_format(&self, width: u32, height: u32, fourcc: FourCC) -> Result<VideoFormat> {
        let mut guard = self.opened()?;
        let ctl = &mut *guard;
        if ctl.state == DeviceState::Streaming {
            return Err(VideoError::invalid_state(format!(
                "{}: cannot change format while streaming",
                self.shared.name
            )));
        }

        let (format, fps, desc) = self.resolve_format(ctl, width, height, fourcc)?;
        let outgrown = self.pool_outgrown(&format)?;
        self.apply_format(ctl, format, fps, desc)?;
        if outgrown {
            self.release_pool(&format);
        }
        self.set_state(ctl, DeviceState::Configured);
        Ok(format)
    }

    /// 设置帧率 (S_PARM)：在同一几何下找该帧率的传感器格式
    pub fn set_fps(&self, fps: u32) -> Result<u32> {
        let mut guard = self.opened()?;
        let ctl = &mut *guard;
        if ctl.state == DeviceState::Streaming {
            return Err(VideoError::invalid_state(format!(
                "{}: cannot change frame rate while streaming",
                self.shared.name
            )));
        }
        if fps == 0 {
            return Err(VideoError::invalid_arg(format!("{}: frame rate must be > 0", self.shared.name)));
        }
        if fps == ctl.fps {
            return Ok(fps);
        }

        let format = ctl.format;
        let Some(sensor) = ctl.sensor.as_mut() else {
            ctl.fps = fps;
            return Ok(fps);
        };

        let desc = sensor
            .formats()
            .find(|f| f.fps == fps && f.matches(format.width, format.height, format.pixel_format));
        match desc {
            Some(desc) => self.apply_format(ctl, format, fps, Some(desc))?,
            None => match sensor.set_param(ParamId::SensorFps, fps as i32) {
                Ok(()) => ctl.fps = fps,
                Err(VideoError::NotSupported(_)) => {
                    return Err(VideoError::invalid_arg(format!(
                        "{}: no {} format at {} fps",
                        self.shared.name, format, fps
                    )))
                }
                Err(e) => return Err(e),
            },
        }

        tracing::info!(target: "embvid::video", "{}: frame rate {} fps", self.shared.name, fps);
        Ok(fps)
    }

    fn resolve_format(
        &self,
        ctl: &Control,
        width: u32,
        height: u32,
        fourcc: FourCC,
    ) -> Result<(VideoFormat, u32, Option<&'static SensorFormat>)> {
        match ctl.sensor.as_deref() {
            Some(sensor) => {
                let mut candidates = sensor.formats().filter(|f| f.matches(width, height, fourcc));
                let first = candidates.next().ok_or_else(|| {
                    VideoError::invalid_arg(format!(
                        "{}: {} has no {}x{} {} format",
                        self.shared.name,
                        sensor.name(),
                        width,
                        height,
                        fourcc
                    ))
                })?;
                // 同几何下优先保持当前帧率
                let desc = std::iter::once(first)
                    .chain(candidates)
                    .find(|f| f.fps == ctl.fps)
                    .unwrap_or(first);
                Ok((VideoFormat::from_sensor(desc), desc.fps, Some(desc)))
            }
            None => {
                let pixel_format = SensorPixelFormat::from_fourcc(fourcc).ok_or_else(|| {
                    VideoError::invalid_arg(format!("{}: unsupported pixel format {}", self.shared.name, fourcc))
                })?;
                if width == 0 || height == 0 {
                    return Err(VideoError::invalid_arg(format!(
                        "{}: invalid geometry {width}x{height}",
                        self.shared.name
                    )));
                }
                Ok((VideoFormat::new(width, height, pixel_format), ctl.fps, None))
            }
        }
    }

    /// 新格式是否放得下现有的池；放不下且读者还持有缓冲时拒绝
    fn pool_outgrown(&self, format: &VideoFormat) -> Result<bool> {
        let q = self.shared.queues.lock();
        let Some(pool) = q.pool.as_ref() else {
            return Ok(false);
        };
        if format.size_image as usize <= pool.capacity() {
            return Ok(false);
        }

        let census = pool.census();
        if census.user > 0 || census.done > 0 {
            return Err(VideoError::invalid_state(format!(
                "{}: {} needs {} bytes but buffers hold {} and {} are still held by the caller",
                self.shared.name,
                format,
                format.size_image,
                pool.capacity(),
                census.user + census.done
            )));
        }
        Ok(true)
    }

    /// 释放放不下新格式的池，之后需要重新 REQBUFS
    fn release_pool(&self, format: &VideoFormat) {
        {
            let mut q = self.shared.queues.lock();
            q.pool = None;
            q.meta.clear();
            q.epoch = q.epoch.wrapping_add(1);
        }
        tracing::info!(target: "embvid::video", "{}: buffers too small for {}, released", self.shared.name, format);
    }

    fn apply_format(
        &self,
        ctl: &mut Control,
        format: VideoFormat,
        fps: u32,
        desc: Option<&'static SensorFormat>,
    ) -> Result<()> {
        let previous = ctl.sensor.as_ref().and_then(|s| s.format());
        if let (Some(sensor), Some(desc)) = (ctl.sensor.as_mut(), desc) {
            sensor.set_format(Some(desc))?;
        }

        if let Err(e) = ctl.capture.set_format(&format) {
            // 底层接口拒绝时把传感器恢复到原格式
            if let (Some(sensor), Some(prev)) = (ctl.sensor.as_mut(), previous) {
                if let Err(err) = sensor.set_format(Some(prev)) {
                    tracing::warn!(target: "embvid::video", "{}: sensor format rollback failed: {}", self.shared.name, err);
                }
            }
            return Err(e);
        }

        ctl.format = format;
        ctl.fps = fps;
        self.shared.queues.lock().format = format;
        tracing::info!(target: "embvid::video", "{}: format {} @ {} fps", self.shared.name, format, fps);
        Ok(())
    }

    // --- 缓冲 ---

    /// 申请 `count` 个缓冲 (REQBUFS)，返回实际个数
    ///
    /// 个数与容量都不变时保留现有的池，载荷指针保持不变。
    pub fn request_buffers(&self, count: u32) -> Result<u32> {
        let mut guard = self.opened()?;
        let ctl = &mut *guard;
        if ctl.state == DeviceState::Streaming {
            return Err(VideoError::invalid_state(format!(
                "{}: cannot reallocate buffers while streaming",
                self.shared.name
            )));
        }
        if count == 0 {
            return Err(VideoError::invalid_arg(format!("{}: buffer count must be > 0", self.shared.name)));
        }

        let count = count.min(self.shared.max_buffers);
        let capacity = self.shared.min_capacity.max(ctl.format.size_image as usize);

        {
            let q = self.shared.queues.lock();
            if let Some(pool) = q.pool.as_ref() {
                if pool.count() == count as usize && pool.capacity() >= capacity {
                    drop(q);
                    self.set_state(ctl, DeviceState::Configured);
                    return Ok(count);
                }
                let census = pool.census();
                if census.user > 0 || census.done > 0 {
                    return Err(VideoError::invalid_state(format!(
                        "{}: {} buffers still held by the caller",
                        self.shared.name,
                        census.user + census.done
                    )));
                }
            }
        }

        // 分配放在锁外
        let pool = FramePool::new(count as usize, capacity)?;
        {
            let mut q = self.shared.queues.lock();
            q.meta = vec![FrameMeta::default(); pool.count()];
            q.pool = Some(pool);
            q.done.clear();
            q.epoch = q.epoch.wrapping_add(1);
        }

        tracing::info!(
            target: "embvid::video",
            "{}: {} buffers of {} bytes",
            self.shared.name,
            count,
            capacity
        );
        self.set_state(ctl, DeviceState::Configured);
        Ok(count)
    }

    /// 当前池的 (个数, 单元素容量)
    pub fn buffers(&self) -> Option<(usize, usize)> {
        let q = self.shared.queues.lock();
        q.pool.as_ref().map(|p| (p.count(), p.capacity()))
    }

    pub fn query_buffer(&self, index: usize) -> Result<BufferInfo> {
        self.ensure_open()?;
        let q = self.shared.queues.lock();
        let pool = self.pool_ref(&q)?;
        self.check_index(pool, index)?;
        Ok(BufferInfo {
            index: index as u32,
            length: pool.capacity() as u32,
            bytes_used: pool.valid_size(index) as u32,
            state: pool.state(index),
        })
    }

    /// 元素的载荷指针，池存活期间不变
    pub fn payload(&self, index: usize) -> Result<NonNull<u8>> {
        self.ensure_open()?;
        let q = self.shared.queues.lock();
        let pool = self.pool_ref(&q)?;
        self.check_index(pool, index)?;
        Ok(pool.payload(index))
    }

    pub(crate) fn arena(&self) -> Option<Arc<PayloadArena>> {
        let q = self.shared.queues.lock();
        q.pool.as_ref().map(|p| Arc::clone(p.arena()))
    }

    /// 把缓冲交还给驱动 (QBUF)
    ///
    /// 读者持有的元素回到空闲链表；已经空闲的元素视为已入队。
    pub fn queue_buffer(&self, index: usize) -> Result<()> {
        self.ensure_open()?;
        let mut q = self.shared.queues.lock();
        let name = &self.shared.name;
        let pool = q
            .pool
            .as_mut()
            .ok_or_else(|| VideoError::invalid_state(format!("{name}: no buffers requested")))?;
        if index >= pool.count() {
            return Err(VideoError::invalid_arg(format!(
                "{name}: buffer index {index} out of range (count {})",
                pool.count()
            )));
        }

        match pool.state(index) {
            BufferState::User if pool.is_lent(index) => {
                return Err(VideoError::invalid_state(format!(
                    "{name}: buffer {index} is still being read"
                )))
            }
            BufferState::User => pool.free(index),
            BufferState::Free => {}
            state => {
                return Err(VideoError::invalid_arg(format!(
                    "{name}: buffer {index} is not held by the caller ({state:?})"
                )))
            }
        }
        Ok(())
    }

    /// 等待下一帧完成 (DQBUF)
    ///
    /// `Duration::ZERO` 不阻塞，`Duration::MAX` 永久等待。超时不消耗任何缓冲。
    pub fn dequeue(&self, timeout: Duration) -> Result<CompletedBuffer> {
        self.dequeue_inner(timeout, false).map(|(buf, _, _)| buf)
    }

    /// `lend` 为真时元素出队即借给 FrameGuard
    fn dequeue_inner(&self, timeout: Duration, lend: bool) -> Result<(CompletedBuffer, Arc<PayloadArena>, VideoFormat)> {
        self.ensure_open()?;
        if !self.shared.sem.take(timeout) {
            bump(&self.shared.counters.timeouts);
            return Err(VideoError::Timeout);
        }

        let mut q = self.shared.queues.lock();
        let format = q.format;
        let Queues { pool, done, meta, .. } = &mut *q;
        let (Some(pool), Some(index)) = (pool.as_mut(), done.pop_front()) else {
            return Err(VideoError::invalid_state(format!(
                "{}: completion queue out of sync",
                self.shared.name
            )));
        };

        pool.hand_to_user(index);
        if lend {
            pool.lend(index);
        }
        let buf = CompletedBuffer {
            index,
            bytes_used: pool.valid_size(index),
            sequence: meta[index].sequence,
            timestamp: meta[index].timestamp,
            payload: pool.payload(index),
        };
        let arena = Arc::clone(pool.arena());
        drop(q);

        bump(&self.shared.counters.dequeued);
        Ok((buf, arena, format))
    }

    /// 出队并借出帧数据，guard 释放时自动归还
    pub fn next_frame(&self, timeout: Duration) -> Result<FrameGuard<'_>> {
        let (buf, arena, format) = self.dequeue_inner(timeout, true)?;
        Ok(FrameGuard {
            device: self,
            arena,
            buf,
            format,
        })
    }

    /// 归还读者持有的元素
    ///
    /// # Panics
    /// 元素已经在空闲链表上 (重复释放)。
    pub fn release(&self, index: usize) -> Result<()> {
        self.ensure_registered()?;
        let mut q = self.shared.queues.lock();
        let pool = self.pool_mut(&mut q)?;
        self.check_index(pool, index)?;
        self.release_locked(pool, index)
    }

    /// 按载荷指针归还；指针不属于本设备的池时返回 `InvalidArg`
    pub fn release_ptr(&self, payload: *const u8) -> Result<()> {
        self.ensure_registered()?;
        let mut q = self.shared.queues.lock();
        let pool = self.pool_mut(&mut q)?;
        let index = pool.index_of(payload).ok_or_else(|| {
            VideoError::invalid_arg(format!("{}: {payload:p} is not a payload of this pool", self.shared.name))
        })?;
        self.release_locked(pool, index)
    }

    fn release_locked(&self, pool: &mut FramePool, index: usize) -> Result<()> {
        if pool.is_lent(index) {
            return Err(VideoError::invalid_state(format!(
                "{}: buffer {index} is still being read",
                self.shared.name
            )));
        }
        match pool.state(index) {
            // Free 会在 free() 里 panic
            BufferState::User | BufferState::Free => {
                pool.free(index);
                Ok(())
            }
            state => Err(VideoError::invalid_arg(format!(
                "{}: buffer {index} is not held by the caller ({state:?})",
                self.shared.name
            ))),
        }
    }

    /// 借出读者持有元素的数据视图 (MappedBuffer)，返回 arena 与有效长度
    pub(crate) fn lend_view(&self, index: usize) -> Result<(Arc<PayloadArena>, usize)> {
        self.ensure_open()?;
        let mut q = self.shared.queues.lock();
        let pool = self.pool_mut(&mut q)?;
        self.check_index(pool, index)?;
        match pool.state(index) {
            BufferState::User if pool.lend(index) => Ok((Arc::clone(pool.arena()), pool.valid_size(index))),
            BufferState::User => Err(VideoError::invalid_state(format!(
                "{}: buffer {index} is already mapped",
                self.shared.name
            ))),
            state => Err(VideoError::invalid_state(format!(
                "{}: buffer {index} is not dequeued ({state:?})",
                self.shared.name
            ))),
        }
    }

    /// 视图结束；池已重建 (arena 不同) 时什么也不做
    pub(crate) fn return_view(&self, arena: &Arc<PayloadArena>, index: usize) {
        let mut q = self.shared.queues.lock();
        if let Some(pool) = q.pool.as_mut().filter(|p| Arc::ptr_eq(p.arena(), arena)) {
            pool.unlend(index);
        }
    }

    pub(crate) fn release_from_guard(&self, arena: &Arc<PayloadArena>, index: usize) {
        let mut q = self.shared.queues.lock();
        match q.pool.as_mut() {
            Some(pool) if Arc::ptr_eq(pool.arena(), arena) && pool.state(index) == BufferState::User => {
                pool.unlend(index);
                pool.free(index);
            }
            _ => tracing::debug!(target: "embvid::video", "{}: frame {} already returned", self.shared.name, index),
        }
    }

    fn pool_ref<'q>(&self, q: &'q Queues) -> Result<&'q FramePool> {
        q.pool
            .as_ref()
            .ok_or_else(|| VideoError::invalid_state(format!("{}: no buffers requested", self.shared.name)))
    }

    fn pool_mut<'q>(&self, q: &'q mut Queues) -> Result<&'q mut FramePool> {
        q.pool
            .as_mut()
            .ok_or_else(|| VideoError::invalid_state(format!("{}: no buffers requested", self.shared.name)))
    }

    fn check_index(&self, pool: &FramePool, index: usize) -> Result<()> {
        if index < pool.count() {
            Ok(())
        } else {
            Err(VideoError::invalid_arg(format!(
                "{}: buffer index {index} out of range (count {})",
                self.shared.name,
                pool.count()
            )))
        }
    }

    // --- 启停 ---

    /// 开始采集：传感器出流，然后底层接口开始搬运
    pub fn stream_on(&self) -> Result<()> {
        let mut guard = self.opened()?;
        let ctl = &mut *guard;
        match ctl.state {
            DeviceState::Configured => {}
            DeviceState::Streaming => {
                return Err(VideoError::invalid_state(format!("{}: already streaming", self.shared.name)))
            }
            _ => {
                return Err(VideoError::invalid_state(format!(
                    "{}: request buffers before streaming",
                    self.shared.name
                )))
            }
        }

        {
            let mut q = self.shared.queues.lock();
            if q.pool.is_none() {
                return Err(VideoError::invalid_state(format!("{}: no buffers requested", self.shared.name)));
            }
            q.done.clear();
            q.sequence = 0;
            q.accepting = true;
        }

        if let Some(sensor) = ctl.sensor.as_mut() {
            if let Err(e) = sensor.set_stream(true) {
                self.shared.quiesce();
                return Err(e);
            }
        }

        let sink = self.sink();
        if let Err(e) = ctl.capture.start_capture(sink, &ctl.format, ctl.fps) {
            if let Some(sensor) = ctl.sensor.as_mut() {
                if let Err(err) = sensor.set_stream(false) {
                    tracing::warn!(target: "embvid::video", "{}: sensor stop failed: {}", self.shared.name, err);
                }
            }
            self.shared.quiesce();
            return Err(e);
        }

        self.set_state(ctl, DeviceState::Streaming);
        tracing::info!(
            target: "embvid::video",
            "{}: streaming {} @ {} fps via {}",
            self.shared.name,
            ctl.format,
            ctl.fps,
            ctl.capture.name()
        );
        Ok(())
    }

    /// 停止采集，回到 `Configured`
    ///
    /// 停止过程中的错误只记录不返回；没有在采集时什么也不做。
    pub fn stream_off(&self) -> Result<()> {
        let mut guard = self.opened()?;
        if guard.state == DeviceState::Streaming {
            self.stream_off_locked(&mut guard);
        }
        Ok(())
    }

    fn stream_off_locked(&self, ctl: &mut Control) {
        self.shared.queues.lock().accepting = false;

        if let Err(e) = ctl.capture.stop_capture() {
            tracing::warn!(target: "embvid::video", "{}: capture stop failed: {}", self.shared.name, e);
        }
        if let Some(sensor) = ctl.sensor.as_mut() {
            if let Err(e) = sensor.set_stream(false) {
                tracing::warn!(target: "embvid::video", "{}: sensor stop failed: {}", self.shared.name, e);
            }
        }

        let (reclaimed, drained) = self.shared.quiesce();
        self.set_state(ctl, DeviceState::Configured);
        tracing::info!(
            target: "embvid::video",
            "{}: stream off ({} reclaimed from hardware, {} drained)",
            self.shared.name,
            reclaimed,
            drained
        );
    }

    /// 硬件侧句柄 (交给底层接口)
    pub fn sink(&self) -> FrameSink {
        FrameSink {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 仿真注入：取一个空闲缓冲，拷入数据并报告完成
    ///
    /// 没有空闲缓冲或未在采集时返回 `Ok(false)`。
    #[cfg(feature = "simulation")]
    pub fn inject_frame(&self, data: &[u8]) -> Result<bool> {
        self.ensure_registered()?;
        let sink = self.sink();
        let Some(mut buf) = sink.alloc_buffer() else {
            return Ok(false);
        };
        if data.len() > buf.capacity() {
            return Err(VideoError::invalid_arg(format!(
                "{}: {} bytes do not fit a {} byte buffer",
                self.shared.name,
                data.len(),
                buf.capacity()
            )));
        }
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        sink.recv_done(buf, data.len());
        Ok(true)
    }

    // --- 传感器参数 ---

    pub fn param_desc(&self, id: ParamId) -> Result<ParamDesc> {
        let guard = self.opened()?;
        sensor_ref(&guard, &self.shared.name)?.param_desc(id)
    }

    pub fn param(&self, id: ParamId) -> Result<i32> {
        let guard = self.opened()?;
        sensor_ref(&guard, &self.shared.name)?.param(id)
    }

    /// 先按描述校验再写入；传感器没有描述时跳过校验
    pub fn set_param(&self, id: ParamId, value: i32) -> Result<()> {
        let mut guard = self.opened()?;
        let name = &self.shared.name;
        let sensor = guard
            .sensor
            .as_mut()
            .ok_or_else(|| VideoError::not_supported(format!("{name}: no sensor attached")))?;

        match sensor.param_desc(id) {
            Ok(desc) => desc.validate(value)?,
            Err(VideoError::NotSupported(_)) => {
                tracing::warn!(
                    target: "embvid::video",
                    "{}: {} has no description for {:?}, writing unchecked",
                    name,
                    sensor.name(),
                    id
                );
            }
            Err(e) => return Err(e),
        }
        sensor.set_param(id, value)
    }

    /// 驱动私有控制
    pub fn sensor_ioctl(&self, cmd: SensorIoctl) -> Result<IoctlReply> {
        let mut guard = self.opened()?;
        let name = &self.shared.name;
        guard
            .sensor
            .as_mut()
            .ok_or_else(|| VideoError::not_supported(format!("{name}: no sensor attached")))?
            .ioctl(cmd)
    }

    pub fn sensor_name(&self) -> Option<String> {
        let guard = self.shared.control.lock().unwrap_or_else(PoisonError::into_inner);
        guard.sensor.as_ref().map(|s| s.name().to_string())
    }

    // --- 观测 ---

    pub fn telemetry(&self) -> DeviceTelemetry {
        let c = &self.shared.counters;
        DeviceTelemetry {
            frames_completed: c.completed.load(Ordering::Relaxed),
            frames_dropped: c.dropped.load(Ordering::Relaxed),
            stale_completions: c.stale.load(Ordering::Relaxed),
            frames_dequeued: c.dequeued.load(Ordering::Relaxed),
            dequeue_timeouts: c.timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn census(&self) -> Option<PoolCensus> {
        self.shared.queues.lock().pool.as_ref().map(FramePool::census)
    }

    /// 完成队列长度
    pub fn completion_queue_len(&self) -> usize {
        self.shared.queues.lock().done.len()
    }

    /// 等待中的完成信号 (信号量当前值)
    pub fn pending_frames(&self) -> usize {
        self.shared.sem.value() as usize
    }

    #[cfg(feature = "serialize")]
    pub fn export_state(&self) -> Result<serde_json::Value> {
        let guard = self.control()?;
        let format = guard.format;
        Ok(serde_json::json!({
            "name": self.shared.name,
            "state": guard.state,
            "format": {
                "width": format.width,
                "height": format.height,
                "pixelformat": format.pixel_format.to_string(),
                "bytesperline": format.bytes_per_line,
                "sizeimage": format.size_image,
            },
            "fps": guard.fps,
            "capture": guard.capture.name(),
            "buffers": self.census(),
            "telemetry": self.telemetry(),
            "sensor": guard.sensor.as_ref().map(|s| s.export_state()),
        }))
    }
}

fn sensor_ref<'a>(ctl: &'a Control, name: &str) -> Result<&'a dyn CameraSensor> {
    ctl.sensor
        .as_deref()
        .ok_or_else(|| VideoError::not_supported(format!("{name}: no sensor attached")))
}
