use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// 计数信号量 (初值 0，上限 max)
///
/// 读者在这里阻塞；值始终等于完成队列长度。
#[derive(Debug)]
pub(crate) struct Semaphore {
    count: Mutex<u32>,
    max: u32,
    cond: Condvar,
}

impl Semaphore {
    pub(crate) fn new(max: u32) -> Self {
        Self {
            count: Mutex::new(0),
            max,
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, u32> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn value(&self) -> u32 {
        *self.lock()
    }

    /// 释放一个许可；已到上限时返回 false
    pub(crate) fn give(&self) -> bool {
        let mut count = self.lock();
        if *count >= self.max {
            return false;
        }
        *count += 1;
        drop(count);
        self.cond.notify_one();
        true
    }

    pub(crate) fn try_take(&self) -> bool {
        let mut count = self.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// 等待一个许可
    ///
    /// `Duration::ZERO` 不阻塞；加上当前时间会溢出的超时 (如 `Duration::MAX`) 视为永久等待。
    pub(crate) fn take(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut count = self.lock();

        while *count == 0 {
            match deadline {
                None => {
                    count = self.cond.wait(count).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    count = self
                        .cond
                        .wait_timeout(count, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        *count -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn zero_timeout_does_not_block() {
        let sem = Semaphore::new(4);
        let start = Instant::now();
        assert!(!sem.take(Duration::ZERO));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn give_saturates_at_max() {
        let sem = Semaphore::new(2);
        assert!(sem.give());
        assert!(sem.give());
        assert!(!sem.give());
        assert_eq!(sem.value(), 2);
        assert!(sem.try_take());
        assert_eq!(sem.value(), 1);
    }

    #[test]
    fn waiter_wakes_on_give() {
        let sem = Arc::new(Semaphore::new(1));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.take(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(sem.give());
        assert!(waiter.join().unwrap());
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn timed_wait_expires() {
        let sem = Semaphore::new(1);
        let start = Instant::now();
        assert!(!sem.take(Duration::from_millis(15)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
