//! 进程级设备注册表
//!
//! 一把全局互斥锁保护；只在 create / destroy / 查找时短暂持有，从不跨越阻塞等待。

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use embvid_core::error::{Result, VideoError};

use crate::device::{Shared, VideoDevice};

static REGISTRY: OnceLock<Mutex<Vec<Arc<Shared>>>> = OnceLock::new();

fn registry() -> MutexGuard<'static, Vec<Arc<Shared>>> {
    REGISTRY
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// 名字唯一；检查与插入在同一次加锁内完成
pub(crate) fn insert(shared: &Arc<Shared>) -> Result<()> {
    let mut devices = registry();
    if devices.iter().any(|d| d.name == shared.name) {
        return Err(VideoError::invalid_arg(format!(
            "video device {} already exists",
            shared.name
        )));
    }
    shared.registered.store(true, Ordering::Release);
    devices.push(Arc::clone(shared));
    Ok(())
}

pub(crate) fn remove(shared: &Arc<Shared>) -> bool {
    let mut devices = registry();
    let before = devices.len();
    devices.retain(|d| !Arc::ptr_eq(d, shared));
    shared.registered.store(false, Ordering::Release);
    devices.len() != before
}

/// 按名字查找已注册的设备
pub fn find(name: &str) -> Option<VideoDevice> {
    registry()
        .iter()
        .find(|d| d.name == name)
        .map(|shared| VideoDevice {
            shared: Arc::clone(shared),
        })
}

/// 已注册设备名 (注册顺序)
pub fn names() -> Vec<String> {
    registry().iter().map(|d| d.name.clone()).collect()
}
