//! 设备注册表与接口自动探测

mod common;

use common::*;
use embvid_core::sensor::DetectEntry;
use embvid_simulation::sensor::{probe, PAGE_SELECT, SCCB_ADDR, SIM_PID};
use embvid_simulation::{sensor_bus, SimBus, SimCapture, StalledCapture, DETECT};
use embvid_v4l2::prelude::*;
use embvid_v4l2::{registry, InitConfig, PortConfig};

#[test]
fn duplicate_names_are_rejected() -> anyhow::Result<()> {
    let first = sim_device("/dev/test-dup", StalledCapture::new())?;
    let err = sim_device("/dev/test-dup", StalledCapture::new()).unwrap_err();
    assert!(matches!(err.downcast_ref::<VideoError>(), Some(VideoError::InvalidArg(_))));

    // 第一个设备不受影响
    assert!(first.is_registered());
    let mut file = embvid_v4l2::open("/dev/test-dup")?;
    assert_eq!(request_buffers(&mut file, 2)?, 2);
    assert_eq!(registry::names().iter().filter(|n| *n == "/dev/test-dup").count(), 1);

    first.destroy()?;
    assert!(registry::find("/dev/test-dup").is_none());
    Ok(())
}

#[test]
fn open_unknown_name_fails() {
    init_tracing();
    assert!(matches!(
        embvid_v4l2::open("/dev/test-missing"),
        Err(VideoError::InvalidArg(_))
    ));
}

#[test]
fn destroyed_handles_stop_working() -> anyhow::Result<()> {
    let device = sim_device("/dev/test-destroyed", StalledCapture::new())?;
    let found = registry::find("/dev/test-destroyed").expect("registered");
    assert_eq!(found.name(), device.name());
    assert_eq!(device.sensor_name().as_deref(), Some("SIMCAM"));

    device.open()?;
    assert!(matches!(device.open(), Err(VideoError::InvalidState(_))));
    device.close()?;
    assert_eq!(device.state(), DeviceState::Unopened);

    found.destroy()?;
    assert!(!device.is_registered());
    assert!(matches!(device.open(), Err(VideoError::InvalidArg(_))));
    assert!(matches!(device.destroy(), Err(VideoError::InvalidArg(_))));
    assert!(matches!(
        embvid_v4l2::open("/dev/test-destroyed"),
        Err(VideoError::InvalidArg(_))
    ));
    Ok(())
}

#[test]
fn close_while_streaming_stops_first() -> anyhow::Result<()> {
    let capture = SimCapture::new();
    let stats = capture.stats();
    let device = sim_device("/dev/test-close", capture)?;
    device.open()?;
    device.request_buffers(2)?;
    device.stream_on()?;
    assert_eq!(device.state(), DeviceState::Streaming);

    device.close()?;
    assert_eq!(device.state(), DeviceState::Unopened);
    assert!(device.census().is_none());
    assert_eq!(device.pending_frames(), 0);
    assert_eq!(stats.starts(), 1);

    // 重新打开后还能采集
    device.open()?;
    device.request_buffers(2)?;
    device.stream_on()?;
    device.next_frame(std::time::Duration::from_secs(2))?;
    device.destroy()?;
    Ok(())
}

#[test]
fn sensor_private_controls_pass_through() -> anyhow::Result<()> {
    let device = sim_device("/dev/test-sensor-ioctl", StalledCapture::new())?;
    device.open()?;

    let reply = device.sensor_ioctl(SensorIoctl::GetChipId)?;
    assert!(matches!(reply, IoctlReply::ChipId(SensorId { pid: SIM_PID })));

    device.set_param(ParamId::TestPattern, 1)?;
    device.sensor_ioctl(SensorIoctl::SwReset)?;
    assert_eq!(device.param(ParamId::TestPattern)?, 0);

    device.destroy()?;
    Ok(())
}

#[test]
fn autodetect_creates_the_dvp_device() -> anyhow::Result<()> {
    init_tracing();
    let devices = embvid_v4l2::init(InitConfig::new(vec![DETECT]).port(
        PortConfig::new(
            SensorPort::Dvp,
            |_addr| Ok(Box::new(sensor_bus()) as Box<dyn SccbIo>),
            || Box::new(SimCapture::new()) as Box<dyn CaptureInterface>,
        )
        .max_buffers(3),
    ))?;
    assert_eq!(devices.len(), 1);

    let device = &devices[0];
    assert_eq!(device.name(), "/dev/video2");
    assert_eq!(device.name(), DeviceSlot::DVP.name());
    assert_eq!(device.max_buffers(), 3);
    assert!(device.caps().contains(V4l2Caps::EXT_PIX_FORMAT));

    let mut file = embvid_v4l2::open("/dev/video2")?;
    file.set_timeout(std::time::Duration::from_secs(2));
    assert_eq!(request_buffers(&mut file, 8)?, 3);
    file.ioctl(Ioctl::StreamOn(embvid_v4l2::uapi::V4L2_BUF_TYPE_VIDEO_CAPTURE))?;
    let buf = dequeue(&mut file)?;
    assert_eq!(buf.bytesused, 640 * 480 * 2);
    queue(&mut file, buf.index)?;

    device.destroy()?;
    Ok(())
}

#[test]
fn ports_without_a_sensor_are_skipped() -> anyhow::Result<()> {
    init_tracing();
    let devices = embvid_v4l2::init(
        InitConfig::new(vec![DETECT])
            // 总线上没有应答芯片 ID
            .port(PortConfig::new(
                SensorPort::Dvp,
                |_addr| Ok(Box::new(SimBus::paged(PAGE_SELECT)) as Box<dyn SccbIo>),
                || Box::new(StalledCapture::new()) as Box<dyn CaptureInterface>,
            ))
            // 打不开传输端点
            .port(PortConfig::new(
                SensorPort::Dvp,
                |addr| Err(VideoError::bus(format!("no adapter for {addr:#04x}"))),
                || Box::new(StalledCapture::new()) as Box<dyn CaptureInterface>,
            ))
            // 探测表里没有这个接口的传感器
            .port(PortConfig::new(
                SensorPort::Spi,
                |_addr| Ok(Box::new(sensor_bus()) as Box<dyn SccbIo>),
                || Box::new(StalledCapture::new()) as Box<dyn CaptureInterface>,
            )),
    )?;
    assert!(devices.is_empty());
    Ok(())
}

fn spi_port() -> PortConfig {
    PortConfig::new(
        SensorPort::Spi,
        |_addr| Ok(Box::new(sensor_bus()) as Box<dyn SccbIo>),
        || Box::new(StalledCapture::new()) as Box<dyn CaptureInterface>,
    )
}

// 几种情况共用 /dev/video3 和 /dev/video4，放在一个测试里顺序执行
#[test]
fn spi_ports_get_their_own_slots() -> anyhow::Result<()> {
    init_tracing();
    let table = vec![DetectEntry {
        name: "SIMCAM",
        port: SensorPort::Spi,
        sccb_addr: SCCB_ADDR,
        probe,
    }];

    let devices = embvid_v4l2::init(InitConfig::new(table.clone()).port(spi_port()).port(spi_port()))?;
    let names: Vec<_> = devices.iter().map(|d| d.name().to_string()).collect();
    assert_eq!(names, ["/dev/video3", "/dev/video4"]);
    assert_eq!(devices[1].name(), DeviceSlot::SPI_1.name());
    for device in &devices {
        device.destroy()?;
    }

    // 第三路 SPI 没有设备号，什么都不创建
    let err = embvid_v4l2::init(
        InitConfig::new(table.clone())
            .port(spi_port())
            .port(spi_port())
            .port(spi_port()),
    )
    .unwrap_err();
    assert!(matches!(err, VideoError::InvalidArg(_)));
    assert!(registry::find("/dev/video3").is_none());

    // 第二路创建失败时，第一路已创建的设备被撤销
    let squatter = sim_device("/dev/video4", StalledCapture::new())?;
    let err = embvid_v4l2::init(InitConfig::new(table).port(spi_port()).port(spi_port())).unwrap_err();
    assert!(matches!(err, VideoError::InvalidArg(_)));
    assert!(registry::find("/dev/video3").is_none());
    assert!(squatter.is_registered());
    squatter.destroy()?;
    Ok(())
}
