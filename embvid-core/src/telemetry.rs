use std::fmt;

/// 视频设备的采集统计
///
/// 由设备内部的原子计数器生成快照，不随每一帧传递。
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct DeviceTelemetry {
    /// 硬件完成并进入完成队列的帧
    pub frames_completed: u64,

    /// 丢帧计数 (硬件取缓冲时池为空)
    pub frames_dropped: u64,

    /// 停流后才到达的过期完成，已丢弃
    pub stale_completions: u64,

    /// 被读者取走的帧
    pub frames_dequeued: u64,

    /// 读者等待超时次数
    pub dequeue_timeouts: u64,
}

impl fmt::Debug for DeviceTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTelemetry")
            .field("completed", &self.frames_completed)
            .field("dropped", &self.frames_dropped)
            .field("stale", &self.stale_completions)
            .field("dequeued", &self.frames_dequeued)
            .field("timeouts", &self.dequeue_timeouts)
            .finish()
    }
}

/// 简单的状态指示灯
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealthStatus {
    Healthy,
    Warning(HealthIssue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthIssue {
    /// 读者消费太慢，缓冲区经常被占满
    FrameDrops,
    /// 硬件在停流后仍然回调
    LateCompletions,
}

impl DeviceTelemetry {
    /// 丢帧超过 10% 视为读者跟不上
    pub fn assess_health(&self) -> DeviceHealthStatus {
        let produced = self.frames_completed + self.frames_dropped;
        if produced > 0 && self.frames_dropped * 10 > produced {
            return DeviceHealthStatus::Warning(HealthIssue::FrameDrops);
        }

        if self.stale_completions > 0 {
            return DeviceHealthStatus::Warning(HealthIssue::LateCompletions);
        }

        DeviceHealthStatus::Healthy
    }
}
