use bit_field::BitField;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::errno::KernelError;

pub const FRAME_SIZE: u64 = 4096;

/// Highest physical address the allocator will ever manage (4 GiB).
const PHYS_CEILING: u64 = 4 * 1024 * 1024 * 1024;
const FRAME_COUNT: usize = (PHYS_CEILING / FRAME_SIZE) as usize;
const BITMAP_WORDS: usize = FRAME_COUNT / 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Available,
    Reserved,
}

/// One entry of the boot-time memory map handed to `init`.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

/// Claiming a specific physical frame, as fixed-address device windows
/// require. Kept separate from the `FrameAllocator` scan so callers can
/// be generic over both capabilities.
pub trait ReserveFrame {
    fn allocate_at(&mut self, addr: PhysAddr) -> Result<PhysFrame, KernelError>;
}

/// Bitmap allocator over 4 KiB physical frames. One bit per frame, set
/// meaning allocated. Starts pessimistic: everything is marked used until
/// the boot memory map proves a region available.
///
/// Frame 0 is never handed out, so a zero address can safely mean
/// "no frame" at the call sites that want a sentinel.
pub struct BitmapFrameAllocator {
    bitmap: [u64; BITMAP_WORDS],
    free_frames: usize,
}

impl BitmapFrameAllocator {
    pub const fn new() -> Self {
        BitmapFrameAllocator {
            bitmap: [u64::MAX; BITMAP_WORDS],
            free_frames: 0,
        }
    }

    /// Apply the boot memory map: free every frame fully contained in an
    /// `Available` region, then walk the `Reserved` regions (kernel image,
    /// boot info) and mark their frames used again. Frame 0 stays reserved
    /// unconditionally.
    ///
    /// Panics if no frame ends up free; the kernel cannot run without
    /// physical memory and there is nothing to fall back to.
    pub fn init(&mut self, regions: &[MemoryRegion]) {
        for region in regions.iter().filter(|r| r.kind == RegionKind::Available) {
            let first = (region.base + FRAME_SIZE - 1) / FRAME_SIZE;
            let last = (region.base + region.length) / FRAME_SIZE; // exclusive
            for frame in first..last.min(FRAME_COUNT as u64) {
                if self.bit(frame as usize) {
                    self.clear_bit(frame as usize);
                    self.free_frames += 1;
                }
            }
        }

        for region in regions.iter().filter(|r| r.kind == RegionKind::Reserved) {
            let first = region.base / FRAME_SIZE;
            let last = (region.base + region.length + FRAME_SIZE - 1) / FRAME_SIZE;
            for frame in first..last.min(FRAME_COUNT as u64) {
                if !self.bit(frame as usize) {
                    self.set_bit(frame as usize);
                    self.free_frames -= 1;
                }
            }
        }

        if !self.bit(0) {
            self.set_bit(0);
            self.free_frames -= 1;
        }

        if self.free_frames == 0 {
            panic!("frame allocator: memory map left zero usable frames");
        }
    }

    fn bit(&self, frame: usize) -> bool {
        self.bitmap[frame / 64].get_bit(frame % 64)
    }

    fn set_bit(&mut self, frame: usize) {
        self.bitmap[frame / 64].set_bit(frame % 64, true);
    }

    fn clear_bit(&mut self, frame: usize) {
        self.bitmap[frame / 64].set_bit(frame % 64, false);
    }

    /// First-fit scan for a free frame. Returns `None` when exhausted.
    pub fn allocate(&mut self) -> Option<PhysFrame> {
        if self.free_frames == 0 {
            return None;
        }
        for (word_idx, word) in self.bitmap.iter().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let frame = word_idx * 64 + bit;
                self.set_bit(frame);
                self.free_frames -= 1;
                return Some(PhysFrame::containing_address(PhysAddr::new(
                    frame as u64 * FRAME_SIZE,
                )));
            }
        }
        None
    }

    /// Claim a specific frame, for mappings whose physical address is fixed
    /// (e.g. a framebuffer base the generic scan must not hand out).
    pub fn allocate_at(&mut self, addr: PhysAddr) -> Result<PhysFrame, KernelError> {
        if !addr.is_aligned(FRAME_SIZE) || addr.as_u64() >= PHYS_CEILING {
            return Err(KernelError::InvalidArgument);
        }
        let frame = (addr.as_u64() / FRAME_SIZE) as usize;
        if self.bit(frame) {
            return Err(KernelError::AlreadyAllocated);
        }
        self.set_bit(frame);
        self.free_frames -= 1;
        Ok(PhysFrame::containing_address(addr))
    }

    pub fn free(&mut self, frame: PhysFrame) {
        let idx = (frame.start_address().as_u64() / FRAME_SIZE) as usize;
        debug_assert!(self.bit(idx), "double free of physical frame {:?}", frame);
        self.clear_bit(idx);
        self.free_frames += 1;
    }

    /// Diagnostics only.
    pub fn free_frame_count(&self) -> usize {
        self.free_frames
    }
}

impl ReserveFrame for BitmapFrameAllocator {
    fn allocate_at(&mut self, addr: PhysAddr) -> Result<PhysFrame, KernelError> {
        BitmapFrameAllocator::allocate_at(self, addr)
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.allocate()
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.free(frame);
    }
}
