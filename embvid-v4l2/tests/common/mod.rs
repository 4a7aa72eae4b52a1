#![allow(dead_code)]

use embvid_simulation::{probe_on, sensor_bus};
use embvid_v4l2::prelude::*;
use embvid_v4l2::uapi::*;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// 仿真传感器 + 给定采集接口的设备 (未打开)
pub fn sim_device(name: &str, capture: impl CaptureInterface + 'static) -> anyhow::Result<VideoDevice> {
    init_tracing();
    let sensor = probe_on(sensor_bus())?;
    let device = VideoDevice::create(
        VideoDeviceConfig::new(name, capture)
            .sensor(sensor)
            .max_buffers(4)
            .caps(V4l2Caps::VIDEO_CAPTURE | V4l2Caps::STREAMING | V4l2Caps::DEVICE_CAPS),
    )?;
    Ok(device)
}

pub fn set_format(file: &mut VideoFile, width: u32, height: u32, fourcc: FourCC) -> anyhow::Result<V4l2Format> {
    let mut fmt = V4l2Format::capture();
    fmt.fmt.pix.width = width;
    fmt.fmt.pix.height = height;
    fmt.fmt.pix.pixelformat = fourcc.0;
    file.ioctl(Ioctl::SetFmt(&mut fmt))?;
    Ok(fmt)
}

pub fn request_buffers(file: &mut VideoFile, count: u32) -> anyhow::Result<u32> {
    let mut req = V4l2RequestBuffers::capture(count);
    file.ioctl(Ioctl::ReqBufs(&mut req))?;
    Ok(req.count)
}

pub fn dequeue(file: &mut VideoFile) -> embvid_v4l2::prelude::Result<V4l2Buffer> {
    let mut buf = V4l2Buffer::capture(0);
    file.ioctl(Ioctl::DQBuf(&mut buf))?;
    Ok(buf)
}

pub fn queue(file: &mut VideoFile, index: u32) -> anyhow::Result<()> {
    let mut buf = V4l2Buffer::capture(index);
    file.ioctl(Ioctl::QBuf(&mut buf))?;
    Ok(())
}
