//! 仿真 GPIO 与 XCLK：只记录电平 / 时钟事件及其时间

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use embvid_core::error::Result;
use embvid_core::time::monotonic;
use embvid_core::traits::{ClockSource, GpioController};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioEvent {
    pub pin: u32,
    pub high: bool,
    pub at: Duration,
}

#[derive(Debug, Default)]
pub struct SimGpio {
    events: Mutex<Vec<GpioEvent>>,
}

impl SimGpio {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<GpioEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<GpioEvent> {
        self.lock().clone()
    }

    /// 某个引脚的电平序列
    pub fn levels(&self, pin: u32) -> Vec<bool> {
        self.lock().iter().filter(|e| e.pin == pin).map(|e| e.high).collect()
    }

    /// 引脚当前电平 (从未驱动过为 None)
    pub fn level(&self, pin: u32) -> Option<bool> {
        self.lock().iter().rev().find(|e| e.pin == pin).map(|e| e.high)
    }
}

impl GpioController for SimGpio {
    fn set_level(&self, pin: u32, high: bool) -> Result<()> {
        tracing::trace!(target: "embvid::sim", pin, high, "gpio");
        self.lock().push(GpioEvent {
            pin,
            high,
            at: monotonic(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    Enable { pin: u32, freq_hz: u32 },
    Disable { pin: u32 },
}

#[derive(Debug, Default)]
pub struct SimClock {
    events: Mutex<Vec<ClockEvent>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ClockEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_running(&self, pin: u32) -> bool {
        self.events()
            .iter()
            .rev()
            .find_map(|e| match *e {
                ClockEvent::Enable { pin: p, .. } if p == pin => Some(true),
                ClockEvent::Disable { pin: p } if p == pin => Some(false),
                _ => None,
            })
            .unwrap_or(false)
    }
}

impl ClockSource for SimClock {
    fn enable(&self, pin: u32, freq_hz: u32) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ClockEvent::Enable { pin, freq_hz });
        Ok(())
    }

    fn disable(&self, pin: u32) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ClockEvent::Disable { pin });
        Ok(())
    }
}
