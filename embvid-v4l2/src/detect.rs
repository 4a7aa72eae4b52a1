//! 子系统初始化：按接口自动探测传感器并创建采集设备
//!
//! 探测表按顺序遍历，每个接口取第一个探测成功的传感器，
//! 设备以该接口的固定设备号命名 (CSI → video0，DVP → video2，SPI → video3 / video4)。

use std::fmt;
use std::sync::Arc;

use embvid_core::builder::SensorConfig;
use embvid_core::error::{Result, VideoError};
use embvid_core::format::SensorPort;
use embvid_core::power::SensorPins;
use embvid_core::sensor::DetectEntry;
use embvid_core::time::Ticker;
use embvid_core::traits::{CameraSensor, ClockSource, GpioController, SccbIo};

use crate::device::{VideoDevice, VideoDeviceConfig, DEFAULT_MAX_BUFFERS};
use crate::stream::CaptureInterface;
use crate::uapi::V4l2Caps;
use crate::vfs::DeviceSlot;

/// 按从机地址打开 SCCB 传输端点
pub type SccbFactory = Box<dyn Fn(u16) -> Result<Box<dyn SccbIo>> + Send + Sync>;

/// 为探测成功的接口构造底层采集接口
pub type CaptureFactory = Box<dyn Fn() -> Box<dyn CaptureInterface> + Send + Sync>;

/// 单个 SoC 接口的探测配置
pub struct PortConfig {
    pub port: SensorPort,
    pub sccb: SccbFactory,
    pub capture: CaptureFactory,
    pub pins: SensorPins,
    pub xclk_freq_hz: u32,
    pub gpio: Option<Arc<dyn GpioController>>,
    pub clock: Option<Arc<dyn ClockSource>>,
    pub ticker: Ticker,
    pub max_buffers: u32,
    pub buffer_capacity: usize,
}

impl fmt::Debug for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortConfig")
            .field("port", &self.port)
            .field("pins", &self.pins)
            .field("xclk_hz", &self.xclk_freq_hz)
            .field("max_buffers", &self.max_buffers)
            .finish()
    }
}

impl PortConfig {
    pub fn new<S, C>(port: SensorPort, sccb: S, capture: C) -> Self
    where
        S: Fn(u16) -> Result<Box<dyn SccbIo>> + Send + Sync + 'static,
        C: Fn() -> Box<dyn CaptureInterface> + Send + Sync + 'static,
    {
        Self {
            port,
            sccb: Box::new(sccb),
            capture: Box::new(capture),
            pins: SensorPins::default(),
            xclk_freq_hz: 24_000_000,
            gpio: None,
            clock: None,
            ticker: Ticker::default(),
            max_buffers: DEFAULT_MAX_BUFFERS,
            buffer_capacity: 0,
        }
    }

    pub fn pins(mut self, pins: SensorPins) -> Self {
        self.pins = pins;
        self
    }

    pub fn xclk(mut self, freq_hz: u32, clock: Arc<dyn ClockSource>) -> Self {
        self.xclk_freq_hz = freq_hz;
        self.clock = Some(clock);
        self
    }

    pub fn gpio(mut self, gpio: Arc<dyn GpioController>) -> Self {
        self.gpio = Some(gpio);
        self
    }

    pub fn ticker(mut self, ticker: Ticker) -> Self {
        self.ticker = ticker;
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

    fn sensor_config(&self, sccb_addr: u16) -> Result<SensorConfig> {
        Ok(SensorConfig {
            sccb: (self.sccb)(sccb_addr)?,
            port: self.port,
            pins: self.pins,
            xclk_freq_hz: self.xclk_freq_hz,
            gpio: self.gpio.clone(),
            clock: self.clock.clone(),
            ticker: self.ticker,
        })
    }
}

/// `init` 的参数：探测表 + 各接口配置
#[derive(Debug, Default)]
pub struct InitConfig {
    pub table: Vec<DetectEntry>,
    pub ports: Vec<PortConfig>,
}

impl InitConfig {
    pub fn new(table: impl Into<Vec<DetectEntry>>) -> Self {
        Self {
            table: table.into(),
            ports: Vec::new(),
        }
    }

    pub fn port(mut self, port: PortConfig) -> Self {
        self.ports.push(port);
        self
    }
}

fn probe_port(table: &[DetectEntry], port: &PortConfig) -> Option<Box<dyn CameraSensor>> {
    for entry in table.iter().filter(|e| e.port == port.port) {
        let config = match port.sensor_config(entry.sccb_addr) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    target: "embvid::detect",
                    "{}: no transport for {} at {:#04x}: {}",
                    port.port,
                    entry.name,
                    entry.sccb_addr,
                    e
                );
                continue;
            }
        };

        match (entry.probe)(config) {
            Ok(sensor) => return Some(sensor),
            Err(e) => {
                tracing::debug!(target: "embvid::detect", "{}: {} not found: {}", port.port, entry.name, e);
            }
        }
    }
    None
}

/// 每个接口按配置顺序分到的设备号；同类接口超出设备号时返回 `InvalidArg`
fn assign_slots(ports: &[PortConfig]) -> Result<Vec<DeviceSlot>> {
    let mut seen: Vec<SensorPort> = Vec::with_capacity(ports.len());
    let mut slots = Vec::with_capacity(ports.len());
    for port in ports {
        let instance = seen.iter().filter(|p| **p == port.port).count() as u32;
        let slot = DeviceSlot::for_port(port.port, instance).ok_or_else(|| {
            VideoError::invalid_arg(format!("{}: no video device slot for port #{}", port.port, instance + 1))
        })?;
        seen.push(port.port);
        slots.push(slot);
    }
    Ok(slots)
}

/// 探测所有已配置的接口并创建采集设备
///
/// 没有找到传感器的接口只记录日志。设备创建失败时，已创建的设备先销毁再返回错误。
pub fn init(config: InitConfig) -> Result<Vec<VideoDevice>> {
    let slots = assign_slots(&config.ports)?;
    let mut devices: Vec<VideoDevice> = Vec::new();

    for (port, slot) in config.ports.iter().zip(slots) {
        let Some(sensor) = probe_port(&config.table, port) else {
            tracing::warn!(target: "embvid::detect", "{}: no sensor detected", port.port);
            continue;
        };

        tracing::info!(target: "embvid::detect", "{}: {} -> {}", port.port, sensor.name(), slot);

        let created = VideoDevice::create(VideoDeviceConfig {
            name: slot.name(),
            max_buffers: port.max_buffers,
            buffer_capacity: port.buffer_capacity,
            caps: V4l2Caps::VIDEO_CAPTURE | V4l2Caps::STREAMING | V4l2Caps::EXT_PIX_FORMAT | V4l2Caps::DEVICE_CAPS,
            capture: (port.capture)(),
            sensor: Some(sensor),
        });
        match created {
            Ok(device) => devices.push(device),
            Err(e) => {
                for device in devices.drain(..).rev() {
                    if let Err(err) = device.destroy() {
                        tracing::warn!(target: "embvid::detect", "{}: rollback failed: {}", device.name(), err);
                    }
                }
                return Err(e);
            }
        }
    }

    Ok(devices)
}
