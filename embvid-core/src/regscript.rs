//! 寄存器脚本引擎
//!
//! 一个脚本是 `(地址, 值)` 的有序序列，中间穿插延时。终止方式有两种：
//! 哨兵地址 (`END_ADDR`) 或切片长度本身，不同传感器家族各用一种。

use crate::error::{Result, VideoError};
use crate::time::Ticker;
use crate::traits::{AddrWidth, SccbIo};

/// 寄存器表中的一行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegValue {
    pub addr: u16,
    pub value: u8,
}

/// 构造表项的简写，用于静态寄存器表
pub const fn reg(addr: u16, value: u8) -> RegValue {
    RegValue { addr, value }
}

/// 解码后的脚本记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegRecord {
    Write { addr: u16, value: u8 },
    /// 毫秒
    Delay(u32),
    End,
}

/// 哨兵地址约定，按传感器家族声明
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScriptMarkers {
    pub delay_addr: Option<u16>,
    pub end_addr: Option<u16>,
}

#[derive(Debug, Clone, Copy)]
pub struct RegScript<'a> {
    regs: &'a [RegValue],
    markers: ScriptMarkers,
}

impl<'a> RegScript<'a> {
    /// 仅以长度为界的脚本，没有哨兵
    pub const fn new(regs: &'a [RegValue]) -> Self {
        Self {
            regs,
            markers: ScriptMarkers {
                delay_addr: None,
                end_addr: None,
            },
        }
    }

    /// 带哨兵地址的脚本；长度仍然是上界
    pub const fn with_markers(regs: &'a [RegValue], markers: ScriptMarkers) -> Self {
        Self { regs, markers }
    }

    /// 表中的行数 (包括哨兵行)
    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn records(&self) -> Records<'a> {
        Records {
            regs: self.regs.iter(),
            markers: self.markers,
            done: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Records<'a> {
    regs: std::slice::Iter<'a, RegValue>,
    markers: ScriptMarkers,
    done: bool,
}

impl Iterator for Records<'_> {
    type Item = RegRecord;

    fn next(&mut self) -> Option<RegRecord> {
        if self.done {
            return None;
        }
        let Some(row) = self.regs.next() else {
            self.done = true;
            return None;
        };

        let record = if Some(row.addr) == self.markers.end_addr {
            self.done = true;
            RegRecord::End
        } else if Some(row.addr) == self.markers.delay_addr {
            RegRecord::Delay(row.value as u32)
        } else {
            RegRecord::Write {
                addr: row.addr,
                value: row.value,
            }
        };
        Some(record)
    }
}

/// 依次执行脚本，遇到第一个传输错误立即返回 (错误原样向上传递)
///
/// 返回实际写入的寄存器个数。
pub fn play<T: SccbIo + ?Sized>(bus: &mut T, script: &RegScript<'_>, ticker: &Ticker) -> Result<usize> {
    let mut writes = 0;

    for record in script.records() {
        match record {
            RegRecord::Write { addr, value } => {
                bus.write(addr, value)?;
                writes += 1;
            }
            RegRecord::Delay(ms) => ticker.delay_ms(ms),
            RegRecord::End => break,
        }
    }

    tracing::trace!(target: "embvid::regscript", writes, "script applied");
    Ok(writes)
}

/// 读-改-写：把 `value` 的低 `length` 位写入寄存器 `[offset, offset + length)` 字段
pub fn set_bits<T: SccbIo + ?Sized>(bus: &mut T, addr: u16, offset: u8, length: u8, value: u8) -> Result<()> {
    if length == 0 || offset as u32 + length as u32 > 8 {
        return Err(VideoError::invalid_arg(format!(
            "bit field offset {offset} length {length} exceeds 8-bit register"
        )));
    }

    let old = bus.read(addr)?;
    let mask = (((1u16 << length) - 1) << offset) as u8;
    let new = (old & !mask) | ((value << offset) & mask);
    bus.write(addr, new)
}

/// 把 16-bit 逻辑地址映射到分页的 8-bit 寄存器文件
///
/// 每次访问先写页选择寄存器 (地址高字节)，再访问页内偏移 (低字节)。
/// 记住上一次的页号，同页连续访问不重复写页寄存器。
#[derive(Debug)]
pub struct PagedRegisters<T> {
    inner: T,
    page_reg: u8,
    cur_page: Option<u8>,
}

impl<T: SccbIo> PagedRegisters<T> {
    pub fn new(inner: T, page_reg: u8) -> Self {
        Self {
            inner,
            page_reg,
            cur_page: None,
        }
    }

    /// 直接访问底层总线；页缓存随之失效
    pub fn inner_mut(&mut self) -> &mut T {
        self.cur_page = None;
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn select(&mut self, addr: u16) -> Result<u8> {
        let page = (addr >> 8) as u8;
        if self.cur_page != Some(page) {
            self.cur_page = None;
            self.inner.write(self.page_reg as u16, page)?;
            self.cur_page = Some(page);
        }
        Ok((addr & 0xff) as u8)
    }
}

impl<T: SccbIo> SccbIo for PagedRegisters<T> {
    fn addr_width(&self) -> AddrWidth {
        AddrWidth::Bits16
    }

    fn read(&mut self, addr: u16) -> Result<u8> {
        let offset = self.select(addr)?;
        self.inner.read(offset as u16)
    }

    fn write(&mut self, addr: u16, value: u8) -> Result<()> {
        let offset = self.select(addr)?;
        let res = self.inner.write(offset as u16, value);
        if offset == self.page_reg {
            // 页寄存器在每一页都可见，直接写它等于换页
            self.cur_page = res.as_ref().ok().map(|_| value);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    const DELAY: u16 = 0xfffe;
    const END: u16 = 0xffff;
    const MARKERS: ScriptMarkers = ScriptMarkers {
        delay_addr: Some(DELAY),
        end_addr: Some(END),
    };

    /// 记录所有访问的 256 字节寄存器文件
    #[derive(Default)]
    struct Recorder {
        regs: Vec<u8>,
        log: Vec<(u16, u8)>,
        fail_at: Option<usize>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                regs: vec![0; 256],
                ..Default::default()
            }
        }
    }

    impl SccbIo for Recorder {
        fn addr_width(&self) -> AddrWidth {
            AddrWidth::Bits8
        }

        fn read(&mut self, addr: u16) -> Result<u8> {
            Ok(self.regs[addr as usize & 0xff])
        }

        fn write(&mut self, addr: u16, value: u8) -> Result<()> {
            if self.fail_at == Some(self.log.len()) {
                return Err(VideoError::bus(format!("nack at {addr:#x}")));
            }
            self.regs[addr as usize & 0xff] = value;
            self.log.push((addr, value));
            Ok(())
        }
    }

    #[test]
    fn sentinel_script_stops_at_end_marker() {
        let table = [reg(0x12, 0x80), reg(DELAY, 2), reg(0x13, 0x01), reg(END, 0), reg(0x14, 0xaa)];
        let script = RegScript::with_markers(&table, MARKERS);
        let mut bus = Recorder::new();

        let start = Instant::now();
        let writes = play(&mut bus, &script, &Ticker::default()).unwrap();

        assert_eq!(writes, 2);
        assert_eq!(bus.log, [(0x12, 0x80), (0x13, 0x01)]);
        assert!(start.elapsed() >= Duration::from_millis(2));
    }

    #[test]
    fn bounded_script_runs_to_length() {
        // 没有哨兵时 0xffff 只是普通地址
        let table = [reg(0x01, 1), reg(0x02, 2), reg(0x03, 3)];
        let mut bus = Recorder::new();
        assert_eq!(play(&mut bus, &RegScript::new(&table), &Ticker::default()).unwrap(), 3);
        assert_eq!(
            RegScript::new(&table).records().last(),
            Some(RegRecord::Write { addr: 0x03, value: 3 })
        );
    }

    #[test]
    fn play_fails_fast_on_transport_error() {
        let table = [reg(0x01, 1), reg(0x02, 2), reg(0x03, 3)];
        let mut bus = Recorder::new();
        bus.fail_at = Some(1);

        let err = play(&mut bus, &RegScript::new(&table), &Ticker::default()).unwrap_err();
        assert!(matches!(err, VideoError::Bus(_)));
        assert_eq!(bus.log, [(0x01, 1)]);
    }

    #[test]
    fn set_bits_updates_only_the_field() {
        let mut bus = Recorder::new();
        bus.regs[0x22] = 0b1010_1010;

        set_bits(&mut bus, 0x22, 2, 3, 0b101).unwrap();
        assert_eq!(bus.regs[0x22], 0b1011_0110);

        // 超出字段宽度的高位被丢弃
        set_bits(&mut bus, 0x22, 0, 1, 0xff).unwrap();
        assert_eq!(bus.regs[0x22], 0b1011_0111);

        assert!(set_bits(&mut bus, 0x22, 6, 3, 1).is_err());
        assert!(set_bits(&mut bus, 0x22, 0, 0, 1).is_err());
    }

    #[test]
    fn paged_access_writes_page_then_offset() {
        let mut paged = PagedRegisters::new(Recorder::new(), 0xf0);

        paged.write(0x3107, 0x9a).unwrap();
        paged.write(0x3108, 0x46).unwrap();
        paged.write(0x0100, 0x01).unwrap();

        let bus = paged.into_inner();
        assert_eq!(
            bus.log,
            [(0xf0, 0x31), (0x07, 0x9a), (0x08, 0x46), (0xf0, 0x01), (0x00, 0x01)]
        );
    }

    #[test]
    fn script_page_select_is_a_plain_write() {
        let table = [reg(0xf0, 0x30), reg(0x01, 0xff)];
        let mut paged = PagedRegisters::new(Recorder::new(), 0xf0);
        play(paged.inner_mut(), &RegScript::new(&table), &Ticker::default()).unwrap();
        assert_eq!(paged.into_inner().log, [(0xf0, 0x30), (0x01, 0xff)]);
    }
}
