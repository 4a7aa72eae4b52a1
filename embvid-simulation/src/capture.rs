//! 仿真采集接口
//!
//! `SimCapture` 在工作线程上按帧率周期产生帧：取空闲缓冲 → 填测试图 → 报告完成。
//! `StalledCapture` 接受启动但从不产生帧，用于超时路径。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use embvid_core::error::{Result, VideoError};
use embvid_core::pixel_format::FourCC;
use embvid_v4l2::device::VideoFormat;
use embvid_v4l2::stream::{CaptureInterface, FrameSink};

/// 工作线程的计数
#[derive(Debug, Default)]
pub struct CaptureStats {
    produced: AtomicU64,
    starved: AtomicU64,
    starts: AtomicU64,
}

impl CaptureStats {
    /// 报告完成的帧数
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// 没取到空闲缓冲的周期数
    pub fn starved(&self) -> u64 {
        self.starved.load(Ordering::Relaxed)
    }

    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct SimCapture {
    name: String,
    frame_limit: Option<u64>,
    format: VideoFormat,
    stats: Arc<CaptureStats>,
    worker: Option<Worker>,
}

impl Default for SimCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCapture {
    pub fn new() -> Self {
        Self {
            name: "SIM-DVP".to_string(),
            frame_limit: None,
            format: VideoFormat::default(),
            stats: Arc::default(),
            worker: None,
        }
    }

    /// 每次启动最多产生 n 帧
    pub fn frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    fn join_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::Release);
        worker.handle.thread().unpark();
        if worker.handle.join().is_err() {
            tracing::error!(target: "embvid::sim", "{}: capture worker panicked", self.name);
        }
    }
}

impl CaptureInterface for SimCapture {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_format(&mut self, format: &VideoFormat) -> Result<()> {
        self.format = *format;
        Ok(())
    }

    fn start_capture(&mut self, sink: FrameSink, format: &VideoFormat, fps: u32) -> Result<()> {
        if self.worker.is_some() {
            return Err(VideoError::invalid_state(format!("{}: already capturing", self.name)));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let job = Job {
            sink,
            format: *format,
            period: Duration::from_secs(1) / fps.max(1),
            limit: self.frame_limit,
            stop: Arc::clone(&stop),
            stats: Arc::clone(&self.stats),
        };
        let handle = thread::Builder::new()
            .name(format!("{}-capture", self.name.to_lowercase()))
            .spawn(move || job.run())?;

        self.stats.starts.fetch_add(1, Ordering::Relaxed);
        self.worker = Some(Worker { stop, handle });
        tracing::debug!(target: "embvid::sim", "{}: capture {} @ {} fps", self.name, format, fps);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        self.join_worker();
        Ok(())
    }
}

impl Drop for SimCapture {
    fn drop(&mut self) {
        self.join_worker();
    }
}

struct Job {
    sink: FrameSink,
    format: VideoFormat,
    period: Duration,
    limit: Option<u64>,
    stop: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
}

impl Job {
    fn run(self) {
        let mut deadline = Instant::now() + self.period;
        let mut sequence: u32 = 0;

        loop {
            // park 可能提前返回，按截止时间补足
            loop {
                if self.stop.load(Ordering::Acquire) {
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::park_timeout(deadline - now);
            }
            deadline += self.period;

            if self.limit.is_some_and(|limit| sequence as u64 >= limit) {
                continue;
            }

            let Some(mut buf) = self.sink.alloc_buffer() else {
                self.stats.starved.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let size = match self.format.size_image as usize {
                0 => buf.capacity(),
                n => n.min(buf.capacity()),
            };
            fill_pattern(&mut buf.as_mut_slice()[..size], self.format.pixel_format, sequence);
            self.sink.recv_done(buf, size);
            self.stats.produced.fetch_add(1, Ordering::Relaxed);
            sequence = sequence.wrapping_add(1);
        }
    }
}

/// 测试图：前 4 字节为帧号 (LE)，其后是随帧号移动的斜坡；JPEG 带 SOI/EOI
pub fn fill_pattern(data: &mut [u8], format: FourCC, sequence: u32) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i as u32).wrapping_add(sequence) as u8;
    }
    if data.len() >= 4 {
        data[..4].copy_from_slice(&sequence.to_le_bytes());
    }
    if format == FourCC::JPEG && data.len() >= 8 {
        let end = data.len();
        data[4..6].copy_from_slice(&[0xff, 0xd8]);
        data[end - 2..].copy_from_slice(&[0xff, 0xd9]);
    }
}

/// 读回测试图中的帧号
pub fn pattern_sequence(data: &[u8]) -> Option<u32> {
    let head = data.get(..4)?;
    Some(u32::from_le_bytes([head[0], head[1], head[2], head[3]]))
}

/// 启动后从不报告完成的采集接口
#[derive(Debug)]
pub struct StalledCapture {
    sink: Option<FrameSink>,
    starts: u32,
}

impl Default for StalledCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl StalledCapture {
    pub fn new() -> Self {
        Self { sink: None, starts: 0 }
    }
}

impl CaptureInterface for StalledCapture {
    fn name(&self) -> &str {
        "STALLED"
    }

    fn set_format(&mut self, _format: &VideoFormat) -> Result<()> {
        Ok(())
    }

    fn start_capture(&mut self, sink: FrameSink, _format: &VideoFormat, _fps: u32) -> Result<()> {
        self.starts += 1;
        self.sink = Some(sink);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        self.sink = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_carries_the_sequence() {
        let mut data = vec![0u8; 64];
        fill_pattern(&mut data, FourCC::YUYV, 0x0102_0304);
        assert_eq!(pattern_sequence(&data), Some(0x0102_0304));
        assert_eq!(data[10], (10u32 + 0x0102_0304) as u8);

        fill_pattern(&mut data, FourCC::JPEG, 7);
        assert_eq!(&data[4..6], &[0xff, 0xd8]);
        assert_eq!(&data[62..], &[0xff, 0xd9]);
        assert_eq!(pattern_sequence(&data[..3]), None);
    }

    #[test]
    fn stop_without_start_is_harmless() {
        let mut capture = SimCapture::new().frame_limit(3);
        capture.stop_capture().unwrap();
        assert_eq!(capture.stats().starts(), 0);
        assert_eq!(capture.name(), "SIM-DVP");
    }
}
