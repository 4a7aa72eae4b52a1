// 开启一些 Clippy 检查，保证代码质量
#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

// 模块定义
pub mod builder;
pub mod error;
pub mod format;
pub mod frame;
pub mod param;
pub mod pixel_format;
pub mod power;
pub mod regscript;
pub mod sensor;
pub mod telemetry;
pub mod time;
pub mod traits;

// 方便驱动作者使用的 Prelude
pub mod prelude {
    pub use crate::builder::SensorConfig;
    pub use crate::error::{Result, VideoError};
    pub use crate::format::{FormatIter, SensorFormat, SensorPort};
    pub use crate::frame::Frame;
    pub use crate::param::{ParamDesc, ParamId};
    pub use crate::pixel_format::{FourCC, SensorPixelFormat, YuvOrder};
    pub use crate::regscript::{reg, RegScript, RegValue, ScriptMarkers};
    pub use crate::sensor::{
        DetectEntry, IoctlReply, SensorCapability, SensorDevice, SensorId, SensorIoctl,
    };
    pub use crate::traits::{AddrWidth, CameraSensor, ClockSource, GpioController, SccbIo};
}

// 版本与构建信息常量
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
