use std::fmt;
use std::sync::Arc;

use crate::error::{Result, VideoError};
use crate::time::Ticker;
use crate::traits::{ClockSource, GpioController};

/// 上电时序中每个电平的最短保持时间 (数据手册要求，不可压缩)
pub const POWER_SEQ_HOLD_MS: u32 = 10;

/// 传感器引脚，未接的引脚为 None
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorPins {
    pub reset: Option<u32>,
    /// 掉电引脚 (低有效器件：高电平掉电)
    pub pwdn: Option<u32>,
    pub xclk: Option<u32>,
}

impl SensorPins {
    pub fn is_empty(&self) -> bool {
        self.reset.is_none() && self.pwdn.is_none() && self.xclk.is_none()
    }
}

/// 上电 / 断电时序
#[derive(Clone)]
pub struct PowerControl {
    pub pins: SensorPins,
    pub xclk_freq_hz: u32,
    gpio: Option<Arc<dyn GpioController>>,
    clock: Option<Arc<dyn ClockSource>>,
    ticker: Ticker,
}

impl fmt::Debug for PowerControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerControl")
            .field("pins", &self.pins)
            .field("xclk_hz", &self.xclk_freq_hz)
            .field("gpio", &self.gpio.is_some())
            .field("clock", &self.clock.is_some())
            .finish()
    }
}

impl PowerControl {
    pub fn new(
        pins: SensorPins,
        xclk_freq_hz: u32,
        gpio: Option<Arc<dyn GpioController>>,
        clock: Option<Arc<dyn ClockSource>>,
        ticker: Ticker,
    ) -> Self {
        Self {
            pins,
            xclk_freq_hz,
            gpio,
            clock,
            ticker,
        }
    }

    fn gpio(&self) -> Result<&dyn GpioController> {
        self.gpio
            .as_deref()
            .ok_or_else(|| VideoError::invalid_arg("sensor pins configured without a GPIO controller"))
    }

    fn hold(&self) {
        self.ticker.delay_ms(POWER_SEQ_HOLD_MS);
    }

    /// 1. 开 XCLK；2. PWDN 高 → 低；3. RESET 低 → 高。每个电平至少保持 10 ms。
    pub fn power_on(&self) -> Result<()> {
        if let Some(pin) = self.pins.xclk {
            let clock = self
                .clock
                .as_deref()
                .ok_or_else(|| VideoError::invalid_arg("XCLK pin configured without a clock source"))?;
            clock.enable(pin, self.xclk_freq_hz)?;
        }

        if let Some(pin) = self.pins.pwdn {
            let gpio = self.gpio()?;
            gpio.set_level(pin, true)?;
            self.hold();
            gpio.set_level(pin, false)?;
            self.hold();
        }

        if let Some(pin) = self.pins.reset {
            let gpio = self.gpio()?;
            gpio.set_level(pin, false)?;
            self.hold();
            gpio.set_level(pin, true)?;
            self.hold();
        }

        tracing::debug!(target: "embvid::sensor", pins = ?self.pins, "sensor powered on");
        Ok(())
    }

    /// 上电的逆序：RESET 拉低，PWDN 拉高，关 XCLK
    ///
    /// 某一步失败时后面的步骤照做，返回第一个错误。
    pub fn power_off(&self) -> Result<()> {
        let mut first_err = None;
        let mut step = |res: Result<()>| {
            if let Err(e) = res {
                tracing::debug!(target: "embvid::sensor", "power off step failed: {}", e);
                first_err.get_or_insert(e);
            }
        };

        if let Some(pin) = self.pins.reset {
            step(self.gpio().and_then(|gpio| gpio.set_level(pin, false)));
        }

        if let Some(pin) = self.pins.pwdn {
            step(self.gpio().and_then(|gpio| gpio.set_level(pin, true)));
        }

        if let (Some(pin), Some(clock)) = (self.pins.xclk, self.clock.as_deref()) {
            step(clock.disable(pin));
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                tracing::debug!(target: "embvid::sensor", pins = ?self.pins, "sensor powered off");
                Ok(())
            }
        }
    }

    /// 仅做复位脉冲 (私有 ioctl HW_RESET)
    pub fn reset_pulse(&self) -> Result<()> {
        let Some(pin) = self.pins.reset else {
            return Err(VideoError::not_supported("no reset pin"));
        };
        let gpio = self.gpio()?;
        gpio.set_level(pin, false)?;
        self.hold();
        gpio.set_level(pin, true)?;
        self.hold();
        Ok(())
    }
}
