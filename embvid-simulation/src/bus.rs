//! 仿真 SCCB 总线：一块寄存器文件 + 写日志 + 故障注入
//!
//! `SimBus` 可以 clone，所有副本共享同一块寄存器文件，
//! 测试保留一个副本观察驱动写了什么。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use embvid_core::error::{Result, VideoError};
use embvid_core::traits::{AddrWidth, SccbIo};

#[derive(Debug, Default)]
struct BusState {
    regs: HashMap<u16, u8>,
    /// 页选择寄存器 (8-bit 地址 + 分页的器件)
    page_reg: Option<u8>,
    page: u8,
    log: Vec<(u16, u8)>,
    reads: usize,
    fail_write_at: Option<usize>,
    fail_reads: bool,
}

impl BusState {
    /// 线上地址 → 寄存器文件的键
    fn key(&self, addr: u16) -> u16 {
        match self.page_reg {
            Some(page_reg) if addr != page_reg as u16 => ((self.page as u16) << 8) | (addr & 0xff),
            _ => addr,
        }
    }
}

#[derive(Clone)]
pub struct SimBus {
    width: AddrWidth,
    state: Arc<Mutex<BusState>>,
}

impl fmt::Debug for SimBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SimBus")
            .field("width", &self.width)
            .field("page_reg", &state.page_reg)
            .field("regs", &state.regs.len())
            .field("writes", &state.log.len())
            .finish()
    }
}

impl SimBus {
    pub fn new(width: AddrWidth) -> Self {
        Self {
            width,
            state: Arc::default(),
        }
    }

    /// 8-bit 地址、靠页寄存器扩展到 16-bit 的器件
    ///
    /// `preset` / `peek` 使用 `(page << 8) | offset` 形式的完整地址。
    pub fn paged(page_reg: u8) -> Self {
        let bus = Self::new(AddrWidth::Bits8);
        bus.lock().page_reg = Some(page_reg);
        bus
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 直接设置寄存器值，不经过总线，不记日志
    pub fn preset(&self, addr: u16, value: u8) {
        self.lock().regs.insert(addr, value);
    }

    pub fn peek(&self, addr: u16) -> u8 {
        self.lock().regs.get(&addr).copied().unwrap_or(0)
    }

    /// 总线上发生过的写 (线上地址, 值)
    pub fn writes(&self) -> Vec<(u16, u8)> {
        self.lock().log.clone()
    }

    pub fn reads(&self) -> usize {
        self.lock().reads
    }

    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.log.clear();
        state.reads = 0;
    }

    /// 第 n 次写 (从 0 计，按日志长度) 返回总线错误
    pub fn fail_write_at(&self, n: Option<usize>) {
        self.lock().fail_write_at = n;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    fn check_addr(&self, addr: u16) -> Result<()> {
        if addr > self.width.max_addr() {
            return Err(VideoError::bus(format!("address {addr:#06x} exceeds {:?} bus", self.width)));
        }
        Ok(())
    }
}

impl SccbIo for SimBus {
    fn addr_width(&self) -> AddrWidth {
        self.width
    }

    fn read(&mut self, addr: u16) -> Result<u8> {
        self.check_addr(addr)?;
        let mut state = self.lock();
        if state.fail_reads {
            return Err(VideoError::bus(format!("read nack at {addr:#04x}")));
        }
        state.reads += 1;
        let key = state.key(addr);
        Ok(state.regs.get(&key).copied().unwrap_or(0))
    }

    fn write(&mut self, addr: u16, value: u8) -> Result<()> {
        self.check_addr(addr)?;
        let mut state = self.lock();
        if state.fail_write_at == Some(state.log.len()) {
            return Err(VideoError::bus(format!("write nack at {addr:#04x}")));
        }

        if state.page_reg == Some(addr as u8) && addr <= 0xff {
            state.page = value;
        }
        let key = state.key(addr);
        state.regs.insert(key, value);
        state.log.push((addr, value));
        Ok(())
    }
}
