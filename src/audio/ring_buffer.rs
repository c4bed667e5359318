//! Lock-free 块粒度环形样本缓冲区
//!
//! 设计目标：
//! - 零锁：生产者（模拟循环）和消费者（音频回调）完全无锁操作
//! - 零分配：所有内存在初始化时预分配
//! - 块发布：生产者只在写满整块时才把数据交给消费者
//! - 溢出策略：宁可丢旧块也要新数据，生产者绝不等待消费者
//!
//! 三个游标都是单调递增的 u32，按 `& mask` 取模：
//! - `write_offset`: 生产者独占
//! - `fill_offset`:  生产者独占，Release 发布整块
//! - `play_offset`:  消费者独占
//!
//! 始终满足 `play <= fill`（回绕安全的无符号差值），
//! 且 `write - play <= capacity`。
//!
//! 溢出回退后到重写完那一块之前，`write` 落在 `fill` 之后；
//! 这期间消费者可能读过 `write`，下一次 `begin_write` 会从 `fill` 继续。

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;
use crossbeam_utils::CachePadded;

use super::format::PcmSample;
use crate::error::{check_power_of_two, check_range, ConfigError};

/// 游标按 u32 回绕，容量必须远小于 2^31
const MAX_CAPACITY: u64 = 1 << 24;

/// 缓冲区几何配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferConfig {
    /// 块数（2 的幂，至少 4）
    pub buffers: u32,
    /// 每块样本数（2 的幂）
    pub block_len: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            // 16 块 × 512 样本 @ 22255Hz ≈ 368ms
            buffers: 16,
            block_len: 512,
        }
    }
}

impl BufferConfig {
    /// 总容量（样本数）
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.buffers * self.block_len
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_power_of_two("buffers", self.buffers as u64)?;
        check_power_of_two("block_len", self.block_len as u64)?;
        // 溢出回退需要至少 4 块，保证回退后写游标仍在播放游标之后
        check_range("buffers", self.buffers as u64, 4, MAX_CAPACITY)?;
        check_range(
            "capacity",
            self.buffers as u64 * self.block_len as u64,
            1,
            MAX_CAPACITY,
        )
    }
}

/// SPSC 环形样本缓冲区
///
/// 样本单元使用 `AtomicCell`：溢出回退时生产者可能改写一个已发布、
/// 消费者正在读的块，这只会产生一次可闻的毛刺，不会是数据竞争。
pub struct SampleBuffer<T: PcmSample> {
    cells: Box<[AtomicCell<T>]>,
    block_len: u32,
    block_mask: u32,
    capacity: u32,
    mask: u32,

    // 每个游标独占一个 cache line
    write_offset: CachePadded<AtomicU32>,
    fill_offset: CachePadded<AtomicU32>,
    play_offset: CachePadded<AtomicU32>,

    overflow_count: AtomicU64,
    memory_locked: AtomicBool,
}

impl<T: PcmSample> SampleBuffer<T> {
    /// 创建缓冲区，所有样本初始化为静音
    pub fn new(config: BufferConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let capacity = config.capacity();
        let cells: Vec<AtomicCell<T>> = (0..capacity)
            .map(|_| AtomicCell::new(T::SILENCE))
            .collect();

        Ok(Self {
            cells: cells.into_boxed_slice(),
            block_len: config.block_len,
            block_mask: config.block_len - 1,
            capacity,
            mask: capacity - 1,
            write_offset: CachePadded::new(AtomicU32::new(0)),
            fill_offset: CachePadded::new(AtomicU32::new(0)),
            play_offset: CachePadded::new(AtomicU32::new(0)),
            overflow_count: AtomicU64::new(0),
            memory_locked: AtomicBool::new(false),
        })
    }

    /// 拆分为生产者/消费者句柄
    ///
    /// 两个句柄都不可 Clone，从类型上保证每个游标只有一个写者。
    pub fn split(self) -> (SampleWriter<T>, SampleReader<T>) {
        let shared = Arc::new(self);
        let write = shared.write_offset.load(Ordering::Relaxed);
        let play = shared.play_offset.load(Ordering::Relaxed);
        (
            SampleWriter {
                buffer: Arc::clone(&shared),
                write,
                pending: 0,
            },
            SampleReader {
                buffer: shared,
                play,
            },
        )
    }

    /// 消费者当前可读的样本数（只计已发布的整块）
    #[inline]
    pub fn read_available(&self) -> u32 {
        let fill = self.fill_offset.load(Ordering::Acquire);
        let play = self.play_offset.load(Ordering::Acquire);
        fill.wrapping_sub(play)
    }

    /// 已写入但未播放的样本数（含未发布的部分块）
    #[inline]
    pub fn unread(&self) -> u32 {
        let write = self.write_offset.load(Ordering::Acquire);
        let play = self.play_offset.load(Ordering::Acquire);
        (write.wrapping_sub(play) as i32).max(0) as u32
    }

    /// 已发布的整块数
    #[inline]
    pub fn filled_blocks(&self) -> u32 {
        self.read_available() / self.block_len
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn block_len(&self) -> u32 {
        self.block_len
    }

    #[inline]
    pub fn buffers(&self) -> u32 {
        self.capacity / self.block_len
    }

    /// 因溢出被丢弃的块数
    #[inline]
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 音频回调里的 page fault 会直接变成欠载。
    /// 返回是否成功锁定
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.cells.as_ptr() as *const libc::c_void;
        let len = self.cells.len() * std::mem::size_of::<AtomicCell<T>>();

        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Sample buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock sample buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.load(Ordering::Acquire) {
            return;
        }

        let ptr = self.cells.as_ptr() as *const libc::c_void;
        let len = self.cells.len() * std::mem::size_of::<AtomicCell<T>>();

        unsafe {
            libc::munlock(ptr, len);
        }

        self.memory_locked.store(false, Ordering::Release);
        log::debug!("Sample buffer memory unlocked");
    }
}

impl<T: PcmSample> Drop for SampleBuffer<T> {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

/// `begin_write` 返回的可写区域
///
/// 区域总在一个块内部，不会跨越环形缓冲区末尾。
pub struct WriteRegion<'a, T: PcmSample> {
    cells: &'a [AtomicCell<T>],
    discarded: bool,
}

impl<'a, T: PcmSample> WriteRegion<'a, T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// 本次申请是否触发了溢出回退
    #[inline]
    pub fn discarded(&self) -> bool {
        self.discarded
    }

    /// 写入单个样本（越界时忽略）
    #[inline]
    pub fn set(&self, index: usize, sample: T) {
        if let Some(cell) = self.cells.get(index) {
            cell.store(sample);
        }
    }

    /// 从切片复制，返回实际复制数
    pub fn copy_from_slice(&self, src: &[T]) -> usize {
        let n = src.len().min(self.cells.len());
        for (cell, &sample) in self.cells[..n].iter().zip(src) {
            cell.store(sample);
        }
        n
    }

    /// 整个区域填同一个值
    pub fn fill(&self, sample: T) {
        for cell in self.cells {
            cell.store(sample);
        }
    }
}

/// 生产者句柄（模拟循环持有）
pub struct SampleWriter<T: PcmSample> {
    buffer: Arc<SampleBuffer<T>>,
    /// write_offset 的本地副本（只有本句柄会写它）
    write: u32,
    /// 最近一次 begin_write 给出的长度
    pending: u32,
}

impl<T: PcmSample> SampleWriter<T> {
    /// 共享的缓冲区（只读查询用）
    pub fn buffer(&self) -> &Arc<SampleBuffer<T>> {
        &self.buffer
    }

    /// 申请写入空间
    ///
    /// 长度被裁剪到 `requested` 和当前块剩余的连续空间。
    /// 若未播放数据加上本次长度会超过总容量，写游标回退到上一个块的起点，
    /// 丢弃最近写入但尚未播放的一块数据。
    pub fn begin_write(&mut self, requested: usize) -> WriteRegion<'_, T> {
        let buffer = &*self.buffer;
        let play = buffer.play_offset.load(Ordering::Acquire);
        let requested = requested.min(buffer.block_len as usize) as u32;

        let mut write = self.write;
        if (write.wrapping_sub(play) as i32) < 0 {
            // 回退后生产者停顿期间，消费者已经读过了写游标：
            // 从已发布的末尾继续，半块重写作废
            let fill = buffer.fill_offset.load(Ordering::Relaxed);
            log::trace!("Play offset passed rewound write offset, resuming at {}", fill);
            write = fill;
            self.write = write;
            buffer.write_offset.store(write, Ordering::Release);
        }

        let mut len = requested.min(buffer.block_len - (write & buffer.block_mask));
        let mut discarded = false;

        if write.wrapping_sub(play) as u64 + len as u64 > buffer.capacity as u64 {
            // 回退到块起点再退一块：整块重写，部分块直接作废
            write = (write & !buffer.block_mask).wrapping_sub(buffer.block_len);
            len = requested;
            discarded = true;

            self.write = write;
            buffer.write_offset.store(write, Ordering::Release);
            let total = buffer.overflow_count.fetch_add(1, Ordering::Relaxed) + 1;
            log::trace!("Sample buffer overflow, dropped a block (total {})", total);
        }

        debug_assert!(
            write.wrapping_add(len).wrapping_sub(play) <= buffer.capacity,
            "write region would pass play offset"
        );

        self.pending = len;
        let start = (write & buffer.mask) as usize;
        WriteRegion {
            cells: &buffer.cells[start..start + len as usize],
            discarded,
        }
    }

    /// 提交写入
    ///
    /// 写满一整块时就地规范化该块并发布给消费者。
    /// 发布了新块时返回当前已填充的块数。
    pub fn end_write(&mut self, actual: usize) -> Option<u32> {
        let buffer = &*self.buffer;
        debug_assert!(actual <= self.pending as usize, "end_write past begin_write");
        let actual = (actual as u32).min(self.pending);
        self.pending = 0;

        if actual == 0 {
            return None;
        }

        let write = self.write.wrapping_add(actual);
        self.write = write;
        buffer.write_offset.store(write, Ordering::Release);

        if write & buffer.block_mask != 0 {
            return None;
        }

        // 刚写完一块
        if T::NEEDS_NORMALIZE {
            let start = (write.wrapping_sub(buffer.block_len) & buffer.mask) as usize;
            for cell in &buffer.cells[start..start + buffer.block_len as usize] {
                cell.store(cell.load().normalize());
            }
        }

        buffer.fill_offset.store(write, Ordering::Release);

        let play = buffer.play_offset.load(Ordering::Acquire);
        let unread = (write.wrapping_sub(play) as i32).max(0) as u32;
        Some(unread / buffer.block_len)
    }

    /// 写入整段样本（内部循环 begin/end）
    ///
    /// 返回写入的样本数（总是等于 `src.len()`，溢出时旧数据被丢弃）
    pub fn write_samples(&mut self, src: &[T]) -> usize {
        let mut written = 0;
        while written < src.len() {
            let n = self.begin_write(src.len() - written).copy_from_slice(&src[written..]);
            self.end_write(n);
            written += n;
        }
        written
    }
}

/// 消费者句柄（音频回调持有）
pub struct SampleReader<T: PcmSample> {
    buffer: Arc<SampleBuffer<T>>,
    /// play_offset 的本地副本（只有本句柄会写它）
    play: u32,
}

impl<T: PcmSample> SampleReader<T> {
    /// 共享的缓冲区（只读查询用）
    pub fn buffer(&self) -> &Arc<SampleBuffer<T>> {
        &self.buffer
    }

    /// 当前可读样本数
    #[inline]
    pub fn available(&self) -> u32 {
        self.buffer
            .fill_offset
            .load(Ordering::Acquire)
            .wrapping_sub(self.play)
    }

    /// 下一个待播放的样本（不消费）
    #[inline]
    pub fn peek(&self) -> Option<T> {
        if self.available() == 0 {
            return None;
        }
        Some(self.buffer.cells[(self.play & self.buffer.mask) as usize].load())
    }

    /// 读取样本（消费者调用）
    ///
    /// 最多读到环形缓冲区末尾，跨越末尾需要调用方再读一次。
    /// 返回实际读取的样本数，数据不够时可能为 0（欠载）。
    #[inline]
    pub fn consume(&mut self, output: &mut [T]) -> usize {
        let buffer = &*self.buffer;
        let start = (self.play & buffer.mask) as usize;
        let contig = buffer.capacity as usize - start;
        let n = output
            .len()
            .min(self.available() as usize)
            .min(contig);

        for (dst, cell) in output[..n].iter_mut().zip(&buffer.cells[start..start + n]) {
            *dst = cell.load();
        }

        self.play = self.play.wrapping_add(n as u32);
        buffer.play_offset.store(self.play, Ordering::Release);
        n
    }

    /// 读取尽可能多的样本（自动跨越环形末尾）
    pub fn consume_all(&mut self, output: &mut [T]) -> usize {
        let mut done = 0;
        while done < output.len() {
            let n = self.consume(&mut output[done..]);
            if n == 0 {
                break;
            }
            done += n;
        }
        done
    }
}
