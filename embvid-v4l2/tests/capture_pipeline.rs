//! 仿真传感器 + 仿真采集接口上的端到端采集

mod common;

use std::time::{Duration, Instant};

use common::*;
use embvid_simulation::{pattern_sequence, SimCapture, StalledCapture};
use embvid_v4l2::prelude::*;
use embvid_v4l2::uapi::*;

const CAPTURE: u32 = V4L2_BUF_TYPE_VIDEO_CAPTURE;

#[test]
fn happy_capture_of_thirty_frames() -> anyhow::Result<()> {
    let capture = SimCapture::new();
    let stats = capture.stats();
    sim_device("/dev/test-happy", capture)?;

    let mut file = embvid_v4l2::open("/dev/test-happy")?;
    file.set_timeout(Duration::from_secs(2));
    let fmt = set_format(&mut file, 640, 480, FourCC::YUYV)?;
    assert_eq!(fmt.fmt.pix.sizeimage, 640 * 480 * 2);
    assert_eq!(request_buffers(&mut file, 4)?, 4);

    for index in 0..4 {
        let mut buf = V4l2Buffer::capture(index);
        file.ioctl(Ioctl::QueryBuf(&mut buf))?;
        assert!(buf.length >= 640 * 480 * 2);

        let mut map = MmapRequest {
            length: buf.length,
            offset: buf.offset(),
            mapped_ptr: std::ptr::null_mut(),
        };
        file.ioctl(Ioctl::Mmap(&mut map))?;
        assert!(!map.mapped_ptr.is_null());
        queue(&mut file, index)?;
    }

    file.ioctl(Ioctl::StreamOn(CAPTURE))?;
    let mut last = None;
    for _ in 0..30 {
        let buf = dequeue(&mut file)?;
        assert_eq!(buf.bytesused, 640 * 480 * 2);
        assert_ne!(buf.flags & V4L2_BUF_FLAG_DONE, 0);
        if let Some(prev) = last {
            assert!(buf.sequence > prev);
        }
        last = Some(buf.sequence);

        {
            let data = file.mapped(&buf)?;
            assert_eq!(data.len(), 640 * 480 * 2);
            assert_eq!(pattern_sequence(&data), Some(buf.sequence));
        }

        let census = file.device().census().expect("buffers requested");
        assert_eq!(census.total(), 4);
        assert_eq!(census.user, 1);
        queue(&mut file, buf.index)?;
    }
    file.ioctl(Ioctl::StreamOff(CAPTURE))?;

    let census = file.device().census().expect("buffers requested");
    assert_eq!(census.free, 4);
    assert!(stats.produced() >= 30);

    let telemetry = file.device().telemetry();
    assert_eq!(telemetry.frames_dequeued, 30);
    assert_eq!(telemetry.stale_completions, 0);

    file.device().destroy()?;
    Ok(())
}

#[test]
fn dequeue_times_out_on_a_stalled_interface() -> anyhow::Result<()> {
    sim_device("/dev/test-stalled", StalledCapture::new())?;
    let mut file = embvid_v4l2::open("/dev/test-stalled")?;
    request_buffers(&mut file, 4)?;
    file.ioctl(Ioctl::StreamOn(CAPTURE))?;
    file.set_timeout(Duration::from_millis(10));

    let start = Instant::now();
    for _ in 0..100 {
        assert!(matches!(dequeue(&mut file), Err(VideoError::Timeout)));
    }
    assert!(start.elapsed() >= Duration::from_millis(1000));

    let device = file.device().clone();
    assert_eq!(device.telemetry().dequeue_timeouts, 100);
    assert_eq!(device.census().map(|c| c.free), Some(4));
    assert_eq!(device.pending_frames(), 0);

    file.ioctl(Ioctl::StreamOff(CAPTURE))?;
    device.destroy()?;
    Ok(())
}

#[test]
fn nonblocking_dequeue_returns_immediately() -> anyhow::Result<()> {
    sim_device("/dev/test-nonblock", StalledCapture::new())?;
    let mut file = embvid_v4l2::open("/dev/test-nonblock")?;
    request_buffers(&mut file, 2)?;
    file.ioctl(Ioctl::StreamOn(CAPTURE))?;
    file.set_nonblocking(true);

    let start = Instant::now();
    assert!(matches!(dequeue(&mut file), Err(VideoError::Timeout)));
    assert!(start.elapsed() < Duration::from_millis(500));

    file.device().destroy()?;
    Ok(())
}

#[test]
fn format_reconfigure_between_streams() -> anyhow::Result<()> {
    sim_device("/dev/test-reconf", SimCapture::new())?;
    let mut file = embvid_v4l2::open("/dev/test-reconf")?;
    file.set_timeout(Duration::from_secs(2));

    set_format(&mut file, 640, 480, FourCC::YUYV)?;
    request_buffers(&mut file, 4)?;
    file.ioctl(Ioctl::StreamOn(CAPTURE))?;
    let buf = dequeue(&mut file)?;
    assert_eq!(buf.bytesused, 640 * 480 * 2);
    queue(&mut file, buf.index)?;
    file.ioctl(Ioctl::StreamOff(CAPTURE))?;

    set_format(&mut file, 320, 240, FourCC::RGB565)?;
    let mut fmt = V4l2Format::capture();
    file.ioctl(Ioctl::GetFmt(&mut fmt))?;
    assert_eq!((fmt.fmt.pix.width, fmt.fmt.pix.height), (320, 240));
    assert_eq!(fmt.fmt.pix.pixelformat, FourCC::RGB565.0);
    assert_eq!(fmt.fmt.pix.bytesperline, 640);

    // B 的 fps 来自传感器格式
    let mut parm = V4l2StreamParm::capture();
    file.ioctl(Ioctl::GetParm(&mut parm))?;
    assert_eq!(parm.parm.capture.timeperframe.denominator, 30);

    file.ioctl(Ioctl::StreamOn(CAPTURE))?;
    let buf = dequeue(&mut file)?;
    assert_eq!(buf.bytesused, 320 * 240 * 2);
    assert_eq!(buf.sequence, 0);
    queue(&mut file, buf.index)?;

    file.device().destroy()?;
    Ok(())
}

#[test]
fn growing_the_format_needs_new_buffers() -> anyhow::Result<()> {
    sim_device("/dev/test-grow", SimCapture::new())?;
    let mut file = embvid_v4l2::open("/dev/test-grow")?;
    file.set_timeout(Duration::from_secs(2));

    set_format(&mut file, 320, 240, FourCC::RGB565)?;
    request_buffers(&mut file, 3)?;
    set_format(&mut file, 640, 480, FourCC::YUYV)?;
    assert!(matches!(
        file.ioctl(Ioctl::StreamOn(CAPTURE)),
        Err(VideoError::InvalidState(_))
    ));

    request_buffers(&mut file, 3)?;
    let mut buf = V4l2Buffer::capture(0);
    file.ioctl(Ioctl::QueryBuf(&mut buf))?;
    assert!(buf.length >= 640 * 480 * 2);

    file.ioctl(Ioctl::StreamOn(CAPTURE))?;
    let buf = dequeue(&mut file)?;
    assert_eq!(buf.bytesused, 640 * 480 * 2);
    file.device().destroy()?;
    Ok(())
}

#[test]
fn stream_restart_resets_the_sequence() -> anyhow::Result<()> {
    sim_device("/dev/test-restart", SimCapture::new())?;
    let mut file = embvid_v4l2::open("/dev/test-restart")?;
    file.set_timeout(Duration::from_secs(2));
    set_format(&mut file, 640, 480, FourCC::SBGGR8)?;
    request_buffers(&mut file, 2)?;

    for _ in 0..2 {
        file.ioctl(Ioctl::StreamOn(CAPTURE))?;
        let buf = dequeue(&mut file)?;
        assert_eq!(buf.sequence, 0);
        assert_eq!(buf.bytesused, 640 * 480);
        queue(&mut file, buf.index)?;
        file.ioctl(Ioctl::StreamOff(CAPTURE))?;
        assert_eq!(file.device().state(), DeviceState::Configured);
    }

    // 未在采集时 STREAMOFF 什么也不做
    file.ioctl(Ioctl::StreamOff(CAPTURE))?;
    file.device().destroy()?;
    Ok(())
}

#[test]
fn frame_guard_returns_the_buffer() -> anyhow::Result<()> {
    let device = sim_device("/dev/test-guard", SimCapture::new().frame_limit(2))?;
    device.open()?;
    device.set_format(320, 240, FourCC::RGB565)?;
    device.request_buffers(2)?;
    device.stream_on()?;

    {
        let guard = device.next_frame(Duration::from_secs(2))?;
        let frame = guard.frame();
        assert_eq!((frame.width, frame.height), (320, 240));
        assert_eq!(frame.stride, 640);
        assert!(frame.is_complete());
        assert_eq!(device.census().map(|c| c.user), Some(1));
    }
    assert_eq!(device.census().map(|c| c.user), Some(0));

    device.next_frame(Duration::from_secs(2))?;
    // 帧数上限之后不再有帧
    assert!(matches!(
        device.next_frame(Duration::from_millis(200)),
        Err(VideoError::Timeout)
    ));

    device.destroy()?;
    Ok(())
}

#[test]
fn jpeg_frames_carry_markers() -> anyhow::Result<()> {
    let device = sim_device("/dev/test-jpeg", SimCapture::new())?;
    device.open()?;
    let format = device.set_format(640, 480, FourCC::JPEG)?;
    assert_eq!(format.bytes_per_line, 0);
    device.request_buffers(2)?;
    device.stream_on()?;

    let guard = device.next_frame(Duration::from_secs(2))?;
    let data = guard.data();
    assert_eq!(&data[4..6], &[0xff, 0xd8]);
    assert_eq!(&data[data.len() - 2..], &[0xff, 0xd9]);
    drop(guard);

    device.destroy()?;
    Ok(())
}

#[test]
#[should_panic(expected = "frame buffer overflow")]
fn completion_larger_than_the_buffer_is_fatal() {
    let device = sim_device("/dev/test-overflow", StalledCapture::new()).unwrap();
    device.open().unwrap();
    device.request_buffers(2).unwrap();
    device.stream_on().unwrap();

    let sink = device.sink();
    let buf = sink.alloc_buffer().unwrap();
    let capacity = buf.capacity();
    sink.recv_done(buf, capacity + 1);
}

#[test]
fn late_completion_after_stream_off_is_counted() -> anyhow::Result<()> {
    let device = sim_device("/dev/test-late", StalledCapture::new())?;
    device.open()?;
    device.request_buffers(2)?;
    device.stream_on()?;

    let sink = device.sink();
    let buf = sink.alloc_buffer().expect("free buffer");
    device.stream_off()?;
    sink.recv_done(buf, 16);

    assert_eq!(device.telemetry().stale_completions, 1);
    assert_eq!(device.completion_queue_len(), 0);
    assert_eq!(device.census().map(|c| c.free), Some(2));
    device.destroy()?;
    Ok(())
}

#[test]
fn injected_frames_reach_the_reader() -> anyhow::Result<()> {
    let device = sim_device("/dev/test-inject", StalledCapture::new())?;
    device.open()?;
    assert!(!device.inject_frame(&[0u8; 16])?);

    device.set_format(320, 240, FourCC::RGB565)?;
    device.request_buffers(2)?;
    device.stream_on()?;

    let mut frame = vec![0u8; 320 * 240 * 2];
    embvid_simulation::fill_pattern(&mut frame, FourCC::RGB565, 7);
    assert!(device.inject_frame(&frame)?);
    assert!(device.inject_frame(&frame[..100])?);
    // 池空
    assert!(!device.inject_frame(&frame)?);
    assert_eq!(device.telemetry().frames_dropped, 1);

    let guard = device.next_frame(Duration::ZERO)?;
    assert_eq!(guard.data().len(), frame.len());
    assert_eq!(pattern_sequence(guard.data()), Some(7));
    drop(guard);
    let guard = device.next_frame(Duration::ZERO)?;
    assert_eq!(guard.data().len(), 100);
    drop(guard);

    let too_big = vec![0u8; 1 << 20];
    assert!(matches!(device.inject_frame(&too_big), Err(VideoError::InvalidArg(_))));
    device.destroy()?;
    Ok(())
}

#[test]
fn buffers_under_a_live_view_cannot_be_requeued() -> anyhow::Result<()> {
    let device = sim_device("/dev/test-lent", StalledCapture::new())?;
    device.open()?;
    device.set_format(320, 240, FourCC::RGB565)?;
    device.request_buffers(1)?;
    device.stream_on()?;

    let mut frame = vec![0u8; 320 * 240 * 2];
    embvid_simulation::fill_pattern(&mut frame, FourCC::RGB565, 7);
    assert!(device.inject_frame(&frame)?);

    let guard = device.next_frame(Duration::ZERO)?;
    let index = guard.buffer().index;
    let other = device.clone();
    assert!(matches!(other.queue_buffer(index), Err(VideoError::InvalidState(_))));
    assert!(matches!(other.release(index), Err(VideoError::InvalidState(_))));

    // 唯一的缓冲仍在读者手里，新帧只能丢弃
    embvid_simulation::fill_pattern(&mut frame, FourCC::RGB565, 9);
    assert!(!device.inject_frame(&frame)?);
    assert_eq!(pattern_sequence(guard.data()), Some(7));

    drop(guard);
    assert!(device.inject_frame(&frame)?);
    assert_eq!(pattern_sequence(device.next_frame(Duration::ZERO)?.data()), Some(9));

    device.destroy()?;
    Ok(())
}

#[test]
fn mapped_view_blocks_qbuf_until_dropped() -> anyhow::Result<()> {
    sim_device("/dev/test-mapped", StalledCapture::new())?;
    let mut file = embvid_v4l2::open("/dev/test-mapped")?;
    request_buffers(&mut file, 2)?;
    file.ioctl(Ioctl::StreamOn(CAPTURE))?;
    let device = file.device().clone();
    assert!(device.inject_frame(&[0x5a; 64])?);

    file.set_timeout(Duration::ZERO);
    let buf = dequeue(&mut file)?;
    {
        let view = file.mapped(&buf)?;
        assert_eq!(&view[..], &[0x5a; 64][..]);
        assert!(matches!(file.mapped(&buf), Err(VideoError::InvalidState(_))));
        assert!(matches!(device.queue_buffer(buf.index as usize), Err(VideoError::InvalidState(_))));
    }
    queue(&mut file, buf.index)?;
    assert_eq!(device.census().map(|c| c.user), Some(0));

    device.destroy()?;
    Ok(())
}

#[test]
fn guard_from_an_old_pool_leaves_the_new_pool_alone() -> anyhow::Result<()> {
    let device = sim_device("/dev/test-old-guard", StalledCapture::new())?;
    device.open()?;
    device.request_buffers(1)?;
    device.stream_on()?;
    assert!(device.inject_frame(&[1; 32])?);
    let stale = device.next_frame(Duration::ZERO)?;

    // 关闭后重建的池里同一个索引被新的读者持有
    device.close()?;
    device.open()?;
    device.request_buffers(1)?;
    device.stream_on()?;
    assert!(device.inject_frame(&[2; 32])?);
    let fresh = device.dequeue(Duration::ZERO)?;
    assert_eq!(fresh.index, stale.buffer().index);

    drop(stale);
    assert_eq!(device.census().map(|c| c.user), Some(1));
    device.release(fresh.index)?;

    device.destroy()?;
    Ok(())
}
