// 仿真后端：不接硬件也能跑完整的采集管线
#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod bus;
pub mod capture;
pub mod gpio;
pub mod sensor;

pub use bus::SimBus;
pub use capture::{fill_pattern, pattern_sequence, CaptureStats, SimCapture, StalledCapture};
pub use gpio::{ClockEvent, GpioEvent, SimClock, SimGpio};
pub use sensor::{probe_on, sensor_bus, SimSensor, DETECT};

pub mod prelude {
    pub use crate::bus::SimBus;
    pub use crate::capture::{SimCapture, StalledCapture};
    pub use crate::gpio::{SimClock, SimGpio};
    pub use crate::sensor::{probe_on, sensor_bus, DETECT};
}
