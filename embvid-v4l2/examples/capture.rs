use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytemuck::Zeroable;
use embvid_core::power::SensorPins;
use embvid_simulation::{pattern_sequence, sensor_bus, SimCapture, SimClock, SimGpio, DETECT};
use embvid_v4l2::prelude::*;
use embvid_v4l2::uapi::*;
use embvid_v4l2::{InitConfig, PortConfig};

const FRAMES: usize = 60;

fn main() -> Result<()> {
    // 1. 初始化日志
    tracing_subscriber::fmt::init();

    println!("=== embvid simulated DVP capture ===");

    // 2. 探测：仿真总线上挂一颗 SIMCAM
    let gpio = Arc::new(SimGpio::new());
    let clock = Arc::new(SimClock::new());
    let port = PortConfig::new(
        SensorPort::Dvp,
        |_addr| Ok(Box::new(sensor_bus()) as Box<dyn SccbIo>),
        || Box::new(SimCapture::new()) as Box<dyn CaptureInterface>,
    )
    .pins(SensorPins {
        reset: Some(5),
        pwdn: Some(6),
        xclk: Some(7),
    })
    .xclk(20_000_000, clock.clone())
    .gpio(gpio.clone());

    let devices = embvid_v4l2::init(InitConfig::new(vec![DETECT]).port(port))?;
    let device = devices.first().context("no sensor detected")?;
    println!("Detected {} on {}", device.sensor_name().unwrap_or_default(), device.name());
    println!("  xclk running: {}", clock.is_running(7));

    // 3. 打开设备，列出能力和格式
    let mut file = embvid_v4l2::open(device.name())?;
    file.set_timeout(Duration::from_secs(2));

    let mut cap = V4l2Capability::zeroed();
    file.ioctl(Ioctl::QueryCap(&mut cap))?;
    println!("  driver: {}  bus: {}", read_cstr(&cap.driver), read_cstr(&cap.bus_info));

    for index in 0.. {
        let mut desc = V4l2FmtDesc::zeroed();
        desc.index = index;
        desc.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        if file.ioctl(Ioctl::EnumFmt(&mut desc)).is_err() {
            break;
        }
        println!("  [{}] {} ({})", index, FourCC(desc.pixelformat), read_cstr(&desc.description));
    }

    // 4. 配置格式和缓冲
    let mut fmt = V4l2Format::capture();
    fmt.fmt.pix.width = 320;
    fmt.fmt.pix.height = 240;
    fmt.fmt.pix.pixelformat = FourCC::RGB565.0;
    file.ioctl(Ioctl::SetFmt(&mut fmt)).context("S_FMT")?;

    let mut req = V4l2RequestBuffers::capture(4);
    file.ioctl(Ioctl::ReqBufs(&mut req)).context("REQBUFS")?;
    println!("\nFormat {}x{} sizeimage {}, {} buffers", fmt.fmt.pix.width, fmt.fmt.pix.height, fmt.fmt.pix.sizeimage, req.count);

    // 5. 采集
    file.ioctl(Ioctl::StreamOn(V4L2_BUF_TYPE_VIDEO_CAPTURE))?;
    let start = Instant::now();
    for _ in 0..FRAMES {
        let mut buf = V4l2Buffer::capture(0);
        file.ioctl(Ioctl::DQBuf(&mut buf)).context("DQBUF")?;
        let seq = pattern_sequence(&file.mapped(&buf)?);
        if buf.sequence % 10 == 0 {
            println!(
                "  frame #{:<3} {} bytes  ts {}.{:06}s  pattern {:?}",
                buf.sequence, buf.bytesused, buf.timestamp.tv_sec, buf.timestamp.tv_usec, seq
            );
        }
        file.ioctl(Ioctl::QBuf(&mut buf))?;
    }
    let elapsed = start.elapsed();
    file.ioctl(Ioctl::StreamOff(V4L2_BUF_TYPE_VIDEO_CAPTURE))?;

    let telemetry = device.telemetry();
    println!(
        "\n{} frames in {:.2?} ({:.1} fps), dropped {}, timeouts {}",
        FRAMES,
        elapsed,
        FRAMES as f64 / elapsed.as_secs_f64(),
        telemetry.frames_dropped,
        telemetry.dequeue_timeouts
    );

    // 6. 释放：断电时序可以在 GPIO 记录里看到
    device.destroy()?;
    println!("reset pin levels: {:?}", gpio.levels(5));
    Ok(())
}
