#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod buffer;
pub mod controls;
pub mod detect;
pub mod device;
pub mod ioctl;
pub mod pixel_map;
pub mod registry;
pub mod stream;
pub mod uapi;
pub mod vfs;

mod sync;

pub use buffer::{BufferState, FramePool, PoolCensus};
pub use detect::{init, InitConfig, PortConfig};
pub use device::{BufferInfo, DeviceState, VideoDevice, VideoDeviceConfig, VideoFormat};
pub use ioctl::Ioctl;
pub use stream::{CaptureInterface, CompletedBuffer, DmaBuffer, FrameGuard, FrameSink};
pub use vfs::{device_name, open, DeviceSlot, MappedBuffer, VideoFile};

pub mod prelude {
    pub use crate::device::{DeviceState, VideoDevice, VideoDeviceConfig, VideoFormat};
    pub use crate::ioctl::Ioctl;
    pub use crate::stream::{CaptureInterface, DmaBuffer, FrameSink};
    pub use crate::uapi::V4l2Caps;
    pub use crate::vfs::{DeviceSlot, VideoFile};
    pub use embvid_core::prelude::*;
}
