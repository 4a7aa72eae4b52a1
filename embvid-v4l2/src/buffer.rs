//! 帧缓冲池
//!
//! 一块连续的、按 cache line 对齐的内存 (arena)，切成 `count` 个等长载荷。
//! 元素身份就是索引，载荷指针由索引算出，反向映射是 `(p - base) / stride`。

use std::collections::VecDeque;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use embvid_core::error::{Result, VideoError};

/// DMA 友好的对齐单位
pub const CACHE_LINE: usize = 64;

#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct CacheLine([u8; CACHE_LINE]);

/// 载荷内存
///
/// 只负责内存本身；谁能读写哪个元素由 [`FramePool`] 的状态机决定。
pub struct PayloadArena {
    base: NonNull<u8>,
    lines: usize,
    stride: usize,
    count: usize,
}

// 各元素的访问权由池的状态机串行化 (同一时刻只有硬件或用户一方持有)
unsafe impl Send for PayloadArena {}
unsafe impl Sync for PayloadArena {}

impl fmt::Debug for PayloadArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadArena")
            .field("base", &self.base)
            .field("stride", &self.stride)
            .field("count", &self.count)
            .finish()
    }
}

impl PayloadArena {
    fn new(count: usize, capacity: usize) -> Result<Self> {
        let stride = capacity.div_ceil(CACHE_LINE) * CACHE_LINE;
        let lines = (stride / CACHE_LINE)
            .checked_mul(count)
            .ok_or_else(|| VideoError::OutOfMemory(format!("{count} x {capacity} bytes overflows")))?;

        let mut storage: Vec<CacheLine> = Vec::new();
        storage
            .try_reserve_exact(lines)
            .map_err(|e| VideoError::OutOfMemory(format!("frame pool of {count} x {stride} bytes: {e}")))?;
        storage.resize(lines, CacheLine([0; CACHE_LINE]));

        let base = NonNull::from(Box::leak(storage.into_boxed_slice())).cast::<u8>();
        Ok(Self {
            base,
            lines,
            stride,
            count,
        })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// 元素间距 (即单个元素容量)
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn payload(&self, index: usize) -> NonNull<u8> {
        assert!(index < self.count, "payload index {index} out of range");
        // index < count，偏移落在 arena 内
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * self.stride)) }
    }

    /// 载荷指针反推索引；不在本池内或没有对齐到元素起点时返回 None
    pub fn index_of(&self, ptr: *const u8) -> Option<usize> {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        if addr < base {
            return None;
        }
        let off = addr - base;
        if off % self.stride != 0 {
            return None;
        }
        let index = off / self.stride;
        (index < self.count).then_some(index)
    }

    /// # Safety
    /// 调用者必须在池中持有该元素 (用户态或硬件态)，期间没有其他写者。
    pub(crate) unsafe fn slice(&self, index: usize, len: usize) -> &[u8] {
        let len = len.min(self.stride);
        std::slice::from_raw_parts(self.payload(index).as_ptr(), len)
    }

    /// # Safety
    /// 调用者必须以硬件态独占该元素。
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, index: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.payload(index).as_ptr(), self.stride)
    }
}

impl Drop for PayloadArena {
    fn drop(&mut self) {
        let lines = std::ptr::slice_from_raw_parts_mut(self.base.cast::<CacheLine>().as_ptr(), self.lines);
        // 由 new() 中 Box::leak 得到，这里归还
        unsafe { drop(Box::from_raw(lines)) };
    }
}

/// 元素所处的位置，任意时刻恰好一个
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// 在空闲链表上，可供硬件取用
    Free,
    /// 硬件正在填充
    Hardware,
    /// 在完成队列中等待读者
    Done,
    /// 已被读者取走
    User,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: BufferState,
    valid_size: usize,
    /// 用户态元素上有活着的数据视图 (FrameGuard / MappedBuffer)
    lent: bool,
}

/// 各状态的元素个数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct PoolCensus {
    pub free: usize,
    pub hardware: usize,
    pub done: usize,
    pub user: usize,
}

impl PoolCensus {
    pub fn total(&self) -> usize {
        self.free + self.hardware + self.done + self.user
    }
}

/// 固定个数、固定容量的帧缓冲池
///
/// 链表操作需要 `&mut self`，由设备的临界区锁串行化。
#[derive(Debug)]
pub struct FramePool {
    arena: Arc<PayloadArena>,
    free: VecDeque<usize>,
    slots: Vec<Slot>,
}

impl FramePool {
    pub fn new(count: usize, capacity: usize) -> Result<Self> {
        if count == 0 || capacity == 0 {
            return Err(VideoError::invalid_arg(format!(
                "frame pool needs count > 0 and capacity > 0 (got {count} x {capacity})"
            )));
        }

        let arena = PayloadArena::new(count, capacity)?;

        let mut free = VecDeque::new();
        free.try_reserve_exact(count)
            .map_err(|e| VideoError::OutOfMemory(format!("free list: {e}")))?;
        free.extend(0..count);

        tracing::debug!(
            target: "embvid::buffer",
            count,
            capacity = arena.stride(),
            "frame pool created"
        );

        Ok(Self {
            arena: Arc::new(arena),
            free,
            slots: vec![
                Slot {
                    state: BufferState::Free,
                    valid_size: 0,
                    lent: false,
                };
                count
            ],
        })
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// 单个元素容量 (向上取整到 cache line)
    pub fn capacity(&self) -> usize {
        self.arena.stride()
    }

    pub fn arena(&self) -> &Arc<PayloadArena> {
        &self.arena
    }

    pub fn payload(&self, index: usize) -> NonNull<u8> {
        self.arena.payload(index)
    }

    pub fn index_of(&self, ptr: *const u8) -> Option<usize> {
        self.arena.index_of(ptr)
    }

    pub fn state(&self, index: usize) -> BufferState {
        self.slots[index].state
    }

    /// 完成时写入的有效字节数；只在 Done / User 状态有意义
    pub fn valid_size(&self, index: usize) -> usize {
        self.slots[index].valid_size
    }

    pub fn is_lent(&self, index: usize) -> bool {
        self.slots[index].lent
    }

    /// 借出用户态元素的数据视图；已借出或不在用户态时返回 false
    pub(crate) fn lend(&mut self, index: usize) -> bool {
        let slot = &mut self.slots[index];
        if slot.state != BufferState::User || slot.lent {
            return false;
        }
        slot.lent = true;
        true
    }

    pub(crate) fn unlend(&mut self, index: usize) {
        self.slots[index].lent = false;
    }

    /// O(1) 取空闲链表头；池空返回 None，不等待
    pub fn alloc(&mut self) -> Option<usize> {
        let index = self.free.pop_front()?;
        self.slots[index].state = BufferState::Hardware;
        Some(index)
    }

    /// 归还到空闲链表尾，清零有效长度
    ///
    /// 重复释放是编程错误，直接 panic。
    pub fn free(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        assert!(slot.state != BufferState::Free, "double free of frame buffer {index}");
        debug_assert!(!slot.lent, "frame buffer {index} freed while lent");
        slot.state = BufferState::Free;
        slot.valid_size = 0;
        self.free.push_back(index);
    }

    /// 硬件完成：记录有效长度
    ///
    /// 超过容量说明池的尺寸小于传感器声明的最大帧，属于配置错误，panic。
    pub(crate) fn complete(&mut self, index: usize, size: usize) {
        let capacity = self.capacity();
        assert!(
            size <= capacity,
            "frame buffer overflow: completion of {size} bytes into buffer {index} of {capacity} bytes"
        );
        let slot = &mut self.slots[index];
        debug_assert_eq!(slot.state, BufferState::Hardware);
        slot.state = BufferState::Done;
        slot.valid_size = size;
    }

    pub(crate) fn hand_to_user(&mut self, index: usize) {
        debug_assert_eq!(self.slots[index].state, BufferState::Done);
        self.slots[index].state = BufferState::User;
    }

    /// 把硬件还没交回的元素全部收回空闲链表 (停流后调用)
    pub(crate) fn reclaim_hardware(&mut self) -> usize {
        let mut reclaimed = 0;
        for index in 0..self.slots.len() {
            if self.slots[index].state == BufferState::Hardware {
                self.free(index);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub fn census(&self) -> PoolCensus {
        self.slots.iter().fold(PoolCensus::default(), |mut c, s| {
            match s.state {
                BufferState::Free => c.free += 1,
                BufferState::Hardware => c.hardware += 1,
                BufferState::Done => c.done += 1,
                BufferState::User => c.user += 1,
            }
            c
        })
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_are_cache_aligned_and_stable() {
        let pool = FramePool::new(3, 1000).unwrap();
        assert_eq!(pool.capacity(), 1024);
        for i in 0..3 {
            let p = pool.payload(i);
            assert_eq!(p.as_ptr() as usize % CACHE_LINE, 0);
            assert_eq!(pool.payload(i), p);
            assert_eq!(pool.index_of(p.as_ptr()), Some(i));
        }
    }

    #[test]
    fn reverse_map_rejects_foreign_pointers() {
        let pool = FramePool::new(2, 128).unwrap();
        let base = pool.payload(0).as_ptr();
        assert_eq!(pool.index_of(base.wrapping_add(1)), None);
        assert_eq!(pool.index_of(base.wrapping_add(256)), None);
        assert_eq!(pool.index_of(std::ptr::null()), None);

        let other = FramePool::new(2, 128).unwrap();
        assert_eq!(pool.index_of(other.payload(0).as_ptr()), None);
    }

    #[test]
    fn alloc_is_fifo_and_returns_none_when_empty() {
        let mut pool = FramePool::new(2, 64).unwrap();
        assert_eq!(pool.alloc(), Some(0));
        assert_eq!(pool.alloc(), Some(1));
        assert_eq!(pool.alloc(), None);

        pool.free(0);
        assert_eq!(pool.state(0), BufferState::Free);
        assert_eq!(pool.alloc(), Some(0));
    }

    #[test]
    fn free_resets_valid_size() {
        let mut pool = FramePool::new(1, 64).unwrap();
        let i = pool.alloc().unwrap();
        pool.complete(i, 48);
        assert_eq!(pool.valid_size(i), 48);
        pool.hand_to_user(i);
        pool.free(i);
        assert_eq!(pool.valid_size(i), 0);
    }

    #[test]
    fn census_conserves_count() {
        let mut pool = FramePool::new(4, 64).unwrap();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let _c = pool.alloc().unwrap();
        pool.complete(a, 10);
        pool.complete(b, 10);
        pool.hand_to_user(b);

        let census = pool.census();
        assert_eq!(
            census,
            PoolCensus {
                free: 1,
                hardware: 1,
                done: 1,
                user: 1
            }
        );
        assert_eq!(census.total(), pool.count());

        assert_eq!(pool.reclaim_hardware(), 1);
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn only_user_elements_can_be_lent_once() {
        let mut pool = FramePool::new(2, 64).unwrap();
        let i = pool.alloc().unwrap();
        assert!(!pool.lend(i));
        pool.complete(i, 8);
        assert!(!pool.lend(i));

        pool.hand_to_user(i);
        assert!(pool.lend(i));
        assert!(pool.is_lent(i));
        assert!(!pool.lend(i));

        pool.unlend(i);
        pool.free(i);
        assert!(!pool.is_lent(i));
    }

    #[test]
    fn zero_sized_pools_are_rejected() {
        assert!(matches!(FramePool::new(0, 64), Err(VideoError::InvalidArg(_))));
        assert!(matches!(FramePool::new(4, 0), Err(VideoError::InvalidArg(_))));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut pool = FramePool::new(1, 64).unwrap();
        pool.free(0);
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn oversized_completion_panics() {
        let mut pool = FramePool::new(1, 64).unwrap();
        let i = pool.alloc().unwrap();
        pool.complete(i, 65);
    }
}
