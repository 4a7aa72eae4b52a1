use crate::pixel_format::FourCC;
use std::time::Duration;

/// 已完成帧的只读视图
/// 生命周期 'a 绑定到缓冲池中的载荷，零拷贝。
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// 有效数据 (长度 = bytesused)
    pub data: &'a [u8],

    pub width: u32,

    pub height: u32,

    /// 每行字节数；压缩格式为 0
    pub stride: usize,

    pub format: FourCC,

    /// 自 STREAMON 起的帧序号
    pub sequence: u32,

    /// 完成时刻 (单调时钟)
    pub timestamp: Duration,

    /// 缓冲区在池中的索引
    pub index: usize,
}

impl Frame<'_> {
    /// 数据是否是一幅完整的未压缩图像
    pub fn is_complete(&self) -> bool {
        if self.stride == 0 {
            return !self.data.is_empty();
        }
        self.data.len() >= self.stride * self.height as usize
    }
}
