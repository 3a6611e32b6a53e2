//! Host-side stand-ins for the machine: a frame allocator backed by the
//! test process's heap, and a tiny ELF64 image builder.
//!
//! Frames are leaked 4 KiB-aligned allocations, so their addresses are
//! valid to dereference directly. With the physical window offset at zero
//! under test, page-table walks and user-memory copies work unchanged.

use std::collections::HashSet;

use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::errno::KernelError;
use crate::memory::frame_allocator::ReserveFrame;

#[repr(align(4096))]
struct FrameBox([u8; 4096]);

pub struct HostFrameAllocator {
    handed_out: HashSet<u64>,
    /// Fixed device frames claimed through `allocate_at`. Never backed by
    /// real memory and never dereferenced; they only live in page entries.
    reserved: HashSet<u64>,
    allocated: usize,
    freed: usize,
}

impl HostFrameAllocator {
    pub fn new() -> Self {
        HostFrameAllocator {
            handed_out: HashSet::new(),
            reserved: HashSet::new(),
            allocated: 0,
            freed: 0,
        }
    }

    /// Frames currently live, for leak assertions.
    pub fn outstanding(&self) -> usize {
        self.allocated - self.freed
    }
}

unsafe impl FrameAllocator<Size4KiB> for HostFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let block = Box::leak(Box::new(FrameBox([0u8; 4096])));
        let addr = block as *mut FrameBox as u64;
        assert!(self.handed_out.insert(addr), "duplicate frame address");
        self.allocated += 1;
        Some(PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

impl FrameDeallocator<Size4KiB> for HostFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let addr = frame.start_address().as_u64();
        if self.reserved.remove(&addr) {
            // Device frames are outside the leak accounting.
            return;
        }
        assert!(
            self.handed_out.remove(&addr),
            "freed a frame that was never allocated: {:#x}",
            addr
        );
        self.freed += 1;
        // Intentionally leaked; the test process is short-lived.
    }
}

impl ReserveFrame for HostFrameAllocator {
    fn allocate_at(&mut self, addr: PhysAddr) -> Result<PhysFrame, KernelError> {
        if !addr.is_aligned(4096u64) {
            return Err(KernelError::InvalidArgument);
        }
        if !self.reserved.insert(addr.as_u64()) {
            return Err(KernelError::AlreadyAllocated);
        }
        Ok(PhysFrame::containing_address(addr))
    }
}

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

pub struct ElfSegment {
    vaddr: u64,
    bytes: Vec<u8>,
    memsz: u64,
    flags: u32,
}

impl ElfSegment {
    pub fn code(vaddr: u64, bytes: &[u8]) -> Self {
        ElfSegment {
            vaddr,
            bytes: bytes.to_vec(),
            memsz: bytes.len() as u64,
            flags: PF_R | PF_X,
        }
    }

    pub fn data(vaddr: u64, bytes: &[u8], memsz: u64) -> Self {
        ElfSegment {
            vaddr,
            bytes: bytes.to_vec(),
            memsz,
            flags: PF_R | PF_W,
        }
    }
}

/// Assemble a minimal ET_EXEC image: header, program headers, then the
/// segment bytes packed back to back.
pub fn build_elf(entry: u64, segments: &[ElfSegment]) -> Vec<u8> {
    const EHDR_LEN: usize = 64;
    const PHDR_LEN: usize = 56;

    let phoff = EHDR_LEN;
    let mut data_off = EHDR_LEN + segments.len() * PHDR_LEN;
    let mut image = vec![0u8; data_off];

    // e_ident
    image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // ELFDATA2LSB
    image[6] = 1; // EV_CURRENT
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    image[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    image[24..32].copy_from_slice(&entry.to_le_bytes());
    image[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
    image[52..54].copy_from_slice(&(EHDR_LEN as u16).to_le_bytes());
    image[54..56].copy_from_slice(&(PHDR_LEN as u16).to_le_bytes());
    image[56..58].copy_from_slice(&(segments.len() as u16).to_le_bytes());

    for (i, seg) in segments.iter().enumerate() {
        let p = phoff + i * PHDR_LEN;
        image[p..p + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        image[p + 4..p + 8].copy_from_slice(&seg.flags.to_le_bytes());
        image[p + 8..p + 16].copy_from_slice(&(data_off as u64).to_le_bytes());
        image[p + 16..p + 24].copy_from_slice(&seg.vaddr.to_le_bytes());
        image[p + 24..p + 32].copy_from_slice(&seg.vaddr.to_le_bytes()); // p_paddr
        image[p + 32..p + 40].copy_from_slice(&(seg.bytes.len() as u64).to_le_bytes());
        image[p + 40..p + 48].copy_from_slice(&seg.memsz.to_le_bytes());
        image[p + 48..p + 56].copy_from_slice(&0x1000u64.to_le_bytes()); // p_align
        data_off += seg.bytes.len();
    }

    for seg in segments {
        image.extend_from_slice(&seg.bytes);
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_aligned_and_distinct() {
        let mut fa = HostFrameAllocator::new();
        let a = fa.allocate_frame().unwrap();
        let b = fa.allocate_frame().unwrap();
        assert_eq!(a.start_address().as_u64() % 4096, 0);
        assert_ne!(a, b);
        assert_eq!(fa.outstanding(), 2);
        unsafe { fa.deallocate_frame(a) };
        assert_eq!(fa.outstanding(), 1);
    }

    #[test]
    #[should_panic(expected = "never allocated")]
    fn double_free_is_caught() {
        let mut fa = HostFrameAllocator::new();
        let a = fa.allocate_frame().unwrap();
        unsafe {
            fa.deallocate_frame(a);
            fa.deallocate_frame(a);
        }
    }
}
