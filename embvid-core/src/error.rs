use thiserror::Error;

/// 视频子系统统一错误类型
///
/// 缓冲区溢出 (完成尺寸大于容量) 不在此列：那是配置错误，直接 panic。
#[derive(Error, Debug)]
pub enum VideoError {
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// SCCB 传输或总线错误
    #[error("Bus I/O failed: {0}")]
    Bus(String),

    #[error("Timed out waiting for a frame")]
    Timeout,

    #[error("Sensor probe mismatch: expected PID {expected:#06x}, found {found:#06x}")]
    ProbeMismatch { expected: u16, found: u16 },

    #[error("Sensor rejected format '{0}'")]
    SetFormatFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VideoError {
    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::InvalidArg(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    /// 是否属于传输层错误 (IO 类)
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Bus(_) | Self::Io(_))
    }

    /// 映射为 VFS 层返回的 errno
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArg(_) => libc::EINVAL,
            Self::InvalidState(_) => libc::EBUSY,
            Self::NotSupported(_) => libc::ENOTSUP,
            Self::OutOfMemory(_) => libc::ENOMEM,
            Self::Bus(_) | Self::SetFormatFailed(_) => libc::EIO,
            Self::Timeout => libc::EAGAIN,
            Self::ProbeMismatch { .. } => libc::ENODEV,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, VideoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_follows_vfs_conventions() {
        assert_eq!(VideoError::invalid_arg("x").errno(), libc::EINVAL);
        assert_eq!(VideoError::Timeout.errno(), libc::EAGAIN);
        assert_eq!(
            VideoError::ProbeMismatch {
                expected: 0x9a46,
                found: 0
            }
            .errno(),
            libc::ENODEV
        );
        assert!(VideoError::bus("nack").is_io());
        assert!(!VideoError::SetFormatFailed("vga".into()).is_io());
    }
}
