use std::fmt;
use std::sync::Arc;

use crate::format::SensorPort;
use crate::power::{PowerControl, SensorPins};
use crate::time::Ticker;
use crate::traits::{ClockSource, GpioController, SccbIo};

/// 传感器探测配置
///
/// 由子系统初始化为每个接口构造一次，交给驱动的 probe 函数。
pub struct SensorConfig {
    pub sccb: Box<dyn SccbIo>,
    pub port: SensorPort,
    pub pins: SensorPins,
    pub xclk_freq_hz: u32,
    pub gpio: Option<Arc<dyn GpioController>>,
    pub clock: Option<Arc<dyn ClockSource>>,
    pub ticker: Ticker,
}

impl fmt::Debug for SensorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorConfig")
            .field("port", &self.port)
            .field("pins", &self.pins)
            .field("xclk_hz", &self.xclk_freq_hz)
            .field("addr_width", &self.sccb.addr_width())
            .finish()
    }
}

impl SensorConfig {
    pub fn new(sccb: Box<dyn SccbIo>, port: SensorPort) -> Self {
        Self {
            sccb,
            port,
            pins: SensorPins::default(),
            xclk_freq_hz: 24_000_000,
            gpio: None,
            clock: None,
            ticker: Ticker::default(),
        }
    }

    /// 复位引脚
    pub fn reset_pin(mut self, pin: u32) -> Self {
        self.pins.reset = Some(pin);
        self
    }

    /// 掉电引脚
    pub fn pwdn_pin(mut self, pin: u32) -> Self {
        self.pins.pwdn = Some(pin);
        self
    }

    /// XCLK 引脚、频率与时钟发生器
    pub fn xclk(mut self, pin: u32, freq_hz: u32, clock: Arc<dyn ClockSource>) -> Self {
        self.pins.xclk = Some(pin);
        self.xclk_freq_hz = freq_hz;
        self.clock = Some(clock);
        self
    }

    pub fn gpio(mut self, gpio: Arc<dyn GpioController>) -> Self {
        self.gpio = Some(gpio);
        self
    }

    /// 调度节拍 (默认 1 ms)
    pub fn ticker(mut self, ticker: Ticker) -> Self {
        self.ticker = ticker;
        self
    }

    /// 拆出上电控制与传输端点
    pub fn into_parts(self) -> (Box<dyn SccbIo>, PowerControl, SensorPort, Ticker) {
        let power = PowerControl::new(self.pins, self.xclk_freq_hz, self.gpio, self.clock, self.ticker);
        (self.sccb, power, self.port, self.ticker)
    }
}
