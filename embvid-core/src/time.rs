use std::sync::OnceLock;
use std::time::{Duration, Instant};

// 全局时间锚点，帧时间戳都相对于它
static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// 自子系统首次取时以来的单调时间 (用作帧时间戳)
pub fn monotonic() -> Duration {
    let anchor = PROCESS_START.get_or_init(Instant::now);
    anchor.elapsed()
}

/// 最小节拍；更细的节拍按它处理
pub const MIN_TICK: Duration = Duration::from_micros(1);

/// 短延时上限：粗粒度 tick 的主机在此范围内用忙等
pub const BUSY_WAIT_LIMIT_MS: u32 = 10;

/// 调度器节拍换算与延时
///
/// 任何延时至少一个 tick，亚 tick 的延时不会变成 0。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticker {
    tick: Duration,
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl Ticker {
    pub const fn new(tick: Duration) -> Self {
        let tick = if tick.as_nanos() < MIN_TICK.as_nanos() { MIN_TICK } else { tick };
        Self { tick }
    }

    /// 按调度频率创建 (e.g. FreeRTOS 默认 100 Hz)
    pub fn from_hz(hz: u32) -> Self {
        Self::new(Duration::from_micros(1_000_000 / hz.max(1) as u64))
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// 毫秒换算成 tick 数，向上取整且至少为 1
    pub fn ticks_for(&self, ms: u32) -> u32 {
        let tick_us = self.tick.as_micros().max(1);
        let us = ms as u128 * 1000;
        (us.div_ceil(tick_us).min(u32::MAX as u128) as u32).max(1)
    }

    pub fn delay_ms(&self, ms: u32) {
        if self.tick > Duration::from_millis(1) && ms <= BUSY_WAIT_LIMIT_MS {
            // tick 太粗，上电时序这类短延时用忙等保证精度
            let deadline = Instant::now() + Duration::from_millis(ms.max(1) as u64);
            while Instant::now() < deadline {
                std::hint::spin_loop();
            }
            return;
        }

        std::thread::sleep(self.tick * self.ticks_for(ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_tick_delays_round_up_to_one_tick() {
        let ticker = Ticker::from_hz(100);
        assert_eq!(ticker.tick(), Duration::from_millis(10));
        assert_eq!(ticker.ticks_for(0), 1);
        assert_eq!(ticker.ticks_for(5), 1);
        assert_eq!(ticker.ticks_for(10), 1);
        assert_eq!(ticker.ticks_for(11), 2);
        assert_eq!(Ticker::default().ticks_for(25), 25);
    }

    #[test]
    fn coarse_tick_short_delay_is_not_collapsed() {
        let ticker = Ticker::from_hz(100);
        let start = Instant::now();
        ticker.delay_ms(3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3));
        // 忙等不会被拉长到整个 tick
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn zero_and_sub_microsecond_ticks_are_clamped() {
        assert_eq!(Ticker::new(Duration::ZERO).tick(), MIN_TICK);
        assert_eq!(Ticker::new(Duration::from_nanos(200)).tick(), MIN_TICK);
        assert_eq!(Ticker::from_hz(4_000_000).tick(), MIN_TICK);
        assert_eq!(Ticker::from_hz(4_000_000).ticks_for(10), 10_000);

        let start = Instant::now();
        Ticker::new(Duration::ZERO).delay_ms(5);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn monotonic_never_goes_backwards() {
        let a = monotonic();
        let b = monotonic();
        assert!(b >= a);
    }
}
