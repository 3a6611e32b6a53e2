use alloc::vec::Vec;
use bitflags::bitflags;
use x86_64::{
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{
        page_table::PageTableEntry, FrameAllocator, FrameDeallocator, PageTable, PageTableFlags,
        PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::errno::KernelError;

pub const PAGE_SIZE: u64 = 4096;

/// Four 9-bit translation levels above the 12-bit page offset.
/// Level 3 indexes the root (PML4), level 0 the leaf page table.
const TOP_LEVEL: usize = 3;

/// Index of `vaddr` into the table at `level`. One routine covers every
/// level of the tree; the span of a level is 512^level leaf pages.
fn table_index(vaddr: VirtAddr, level: usize) -> usize {
    ((vaddr.as_u64() >> (12 + 9 * level as u64)) & 0x1FF) as usize
}

/// Entries in the root shared with every process: the kernel half.
const KERNEL_ROOT_START: usize = 256;

bitflags! {
    /// Permissions for a mapped page. PRESENT is implied; execute permission
    /// is modeled as the absence of NO_EXECUTE, matching the hardware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const WRITE   = 1 << 0;
        const USER    = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl MapFlags {
    fn table_flags(self) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if self.contains(MapFlags::WRITE) {
            flags |= PageTableFlags::WRITABLE;
        }
        if self.contains(MapFlags::USER) {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if !self.contains(MapFlags::EXECUTE) {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceState {
    Initialized,
    Destroyed,
}

/// One address space: the architecture page-table tree plus bookkeeping.
///
/// Tracked pages are kept in ascending virtual-address order. Intermediate
/// tables allocated by this space are recorded in `table_frames` so destroy
/// can return them; tables shared from the kernel half are never recorded
/// and never freed here. The root frame itself is the caller's to free;
/// the kernel's own root must never be freed while active.
pub struct AddressSpace {
    root: PhysFrame,
    pages: Vec<VirtAddr>,
    table_frames: Vec<PhysFrame>,
    state: SpaceState,
}

/// The boot path maps all physical memory at this higher-half offset, so
/// kernel code can reach any frame without touching the user half. Hosted
/// tests run with offset 0, where "frames" are ordinary heap memory.
#[cfg(not(test))]
pub const PHYS_OFFSET: u64 = 0xFFFF_8000_0000_0000;
#[cfg(test)]
pub const PHYS_OFFSET: u64 = 0;

pub(crate) fn phys_ptr(paddr: PhysAddr) -> *mut u8 {
    (PHYS_OFFSET + paddr.as_u64()) as *mut u8
}

unsafe fn table_mut(frame: PhysFrame) -> &'static mut PageTable {
    &mut *(phys_ptr(frame.start_address()) as *mut PageTable)
}

unsafe fn table_ref(frame: PhysFrame) -> &'static PageTable {
    &*(phys_ptr(frame.start_address()) as *const PageTable)
}

impl AddressSpace {
    /// Allocate and zero a fresh root table.
    pub fn new<A: FrameAllocator<Size4KiB>>(fa: &mut A) -> Result<Self, KernelError> {
        let root = fa.allocate_frame().ok_or(KernelError::NoMemory)?;
        unsafe { table_mut(root).zero() };
        Ok(AddressSpace {
            root,
            pages: Vec::new(),
            table_frames: Vec::new(),
            state: SpaceState::Initialized,
        })
    }

    /// Adopt the table tree the boot path installed in CR3. Used once, for
    /// the kernel's own address space; its boot mappings are not tracked.
    pub unsafe fn from_active() -> Self {
        let (root, _) = Cr3::read();
        AddressSpace {
            root,
            pages: Vec::new(),
            table_frames: Vec::new(),
            state: SpaceState::Initialized,
        }
    }

    pub fn root_frame(&self) -> PhysFrame {
        self.root
    }

    pub fn state(&self) -> SpaceState {
        self.state
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[VirtAddr] {
        &self.pages
    }

    /// Insert into the sorted tracking array. Entries stay unique because
    /// `new_page` refuses an occupied leaf before tracking anything.
    fn track_page(&mut self, vaddr: VirtAddr) {
        let pos = match self.pages.binary_search(&vaddr) {
            Ok(pos) | Err(pos) => pos,
        };
        self.pages.insert(pos, vaddr);
    }

    /// Walk from the root to the leaf table for `vaddr`, allocating and
    /// zeroing any missing intermediate table on the way down.
    fn ensure_leaf_table<A: FrameAllocator<Size4KiB>>(
        &mut self,
        vaddr: VirtAddr,
        fa: &mut A,
    ) -> Result<&'static mut PageTable, KernelError> {
        let mut table = unsafe { table_mut(self.root) };
        for level in (1..=TOP_LEVEL).rev() {
            let entry = &mut table[table_index(vaddr, level)];
            if entry.is_unused() {
                let frame = fa.allocate_frame().ok_or(KernelError::NoMemory)?;
                unsafe { table_mut(frame).zero() };
                self.table_frames.push(frame);
                // Intermediate entries carry the most permissive bits; the
                // leaf entry is what actually restricts access.
                entry.set_addr(
                    frame.start_address(),
                    PageTableFlags::PRESENT
                        | PageTableFlags::WRITABLE
                        | PageTableFlags::USER_ACCESSIBLE,
                );
            }
            table = unsafe { table_mut(PhysFrame::containing_address(entry.addr())) };
        }
        Ok(table)
    }

    /// Map `vaddr` to the specific frame at `paddr`. Both must be
    /// page-aligned. The page is tracked by this space. Mapping a virtual
    /// page that is already mapped means the rest of the kernel holds a
    /// stale assumption about this space, so that is fatal rather than an
    /// error return; callers dealing with untrusted layouts check
    /// `translate` first.
    pub fn new_page<A: FrameAllocator<Size4KiB>>(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: MapFlags,
        fa: &mut A,
    ) -> Result<(), KernelError> {
        if !vaddr.is_aligned(PAGE_SIZE) || !paddr.is_aligned(PAGE_SIZE) {
            return Err(KernelError::InvalidArgument);
        }
        let leaf = self.ensure_leaf_table(vaddr, fa)?;
        let entry: &mut PageTableEntry = &mut leaf[table_index(vaddr, 0)];
        if !entry.is_unused() {
            panic!("paging: virtual page {:?} mapped twice", vaddr);
        }
        self.track_page(vaddr);
        entry.set_addr(paddr, flags.table_flags());
        Ok(())
    }

    /// Map `vaddr` to an arbitrary free frame. USER is forced on; this is
    /// the path ordinary process pages come from.
    pub fn new_user_page<A>(
        &mut self,
        vaddr: VirtAddr,
        flags: MapFlags,
        fa: &mut A,
    ) -> Result<PhysAddr, KernelError>
    where
        A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let frame = fa.allocate_frame().ok_or(KernelError::NoMemory)?;
        let paddr = frame.start_address();
        match self.new_page(vaddr, paddr, flags | MapFlags::USER, fa) {
            Ok(()) => Ok(paddr),
            Err(e) => {
                unsafe { fa.deallocate_frame(frame) };
                Err(e)
            }
        }
    }

    /// Update the permission bits of an existing 4 KiB mapping. The caller
    /// is responsible for a TLB flush if this space is currently loaded.
    /// Addresses covered by a boot-map huge page are refused; descending
    /// past such an entry would treat the mapped data as a page table.
    pub fn set_page_flags(&mut self, vaddr: VirtAddr, flags: MapFlags) -> Result<(), KernelError> {
        if !vaddr.is_aligned(PAGE_SIZE) {
            return Err(KernelError::InvalidArgument);
        }
        let mut table = unsafe { table_mut(self.root) };
        for level in (1..=TOP_LEVEL).rev() {
            let entry = &table[table_index(vaddr, level)];
            if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(KernelError::InvalidArgument);
            }
            table = unsafe { table_mut(PhysFrame::containing_address(entry.addr())) };
        }
        let entry = &mut table[table_index(vaddr, 0)];
        if entry.is_unused() {
            return Err(KernelError::InvalidArgument);
        }
        entry.set_addr(entry.addr(), flags.table_flags());
        Ok(())
    }

    /// Read-only walk; `None` when any level is absent. Huge-page entries
    /// from the boot identity map terminate the walk early.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let mut table = unsafe { table_ref(self.root) };
        for level in (1..=TOP_LEVEL).rev() {
            let entry = &table[table_index(vaddr, level)];
            if entry.is_unused() {
                return None;
            }
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                let span = 1u64 << (12 + 9 * level as u64);
                return Some(entry.addr() + (vaddr.as_u64() & (span - 1)));
            }
            table = unsafe { table_ref(PhysFrame::containing_address(entry.addr())) };
        }
        let entry = &table[table_index(vaddr, 0)];
        if entry.is_unused() {
            return None;
        }
        Some(entry.addr() + (vaddr.as_u64() & (PAGE_SIZE - 1)))
    }

    /// Leaf entry flags for a mapped 4 KiB page; diagnostics and tests.
    /// `None` for unmapped addresses and for huge-page ranges.
    pub fn page_flags(&self, vaddr: VirtAddr) -> Option<PageTableFlags> {
        let mut table = unsafe { table_ref(self.root) };
        for level in (1..=TOP_LEVEL).rev() {
            let entry = &table[table_index(vaddr, level)];
            if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return None;
            }
            table = unsafe { table_ref(PhysFrame::containing_address(entry.addr())) };
        }
        let entry = &table[table_index(vaddr, 0)];
        if entry.is_unused() {
            None
        } else {
            Some(entry.flags())
        }
    }

    /// Share the kernel half into this space by copying the kernel root's
    /// upper entries. The processes then literally share the kernel's
    /// lower-level tables, so later kernel-side mappings in existing
    /// directories are globally visible.
    pub fn map_kernel_into(&mut self, kernel: &AddressSpace) {
        let src = unsafe { table_ref(kernel.root) };
        let dst = unsafe { table_mut(self.root) };
        for idx in KERNEL_ROOT_START..512 {
            dst[idx] = src[idx].clone();
        }
    }

    /// Copy bytes into this space at `vaddr`, page by page, through the
    /// physical-memory window. Fails if any touched page is unmapped.
    pub fn write_bytes(&self, vaddr: VirtAddr, bytes: &[u8]) -> Result<(), KernelError> {
        let mut written = 0usize;
        while written < bytes.len() {
            let cur = vaddr + written as u64;
            let paddr = self.translate(cur).ok_or(KernelError::InvalidArgument)?;
            let in_page = (PAGE_SIZE - (cur.as_u64() & (PAGE_SIZE - 1))) as usize;
            let chunk = in_page.min(bytes.len() - written);
            unsafe {
                core::ptr::copy_nonoverlapping(bytes[written..].as_ptr(), phys_ptr(paddr), chunk);
            }
            written += chunk;
        }
        Ok(())
    }

    /// Copy bytes out of this space into `buf`. `InvalidArgument` if any
    /// page in the range is unmapped.
    pub fn read_bytes(&self, vaddr: VirtAddr, buf: &mut [u8]) -> Result<(), KernelError> {
        let mut read = 0usize;
        while read < buf.len() {
            let cur = vaddr + read as u64;
            let paddr = self.translate(cur).ok_or(KernelError::InvalidArgument)?;
            let in_page = (PAGE_SIZE - (cur.as_u64() & (PAGE_SIZE - 1))) as usize;
            let chunk = in_page.min(buf.len() - read);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys_ptr(paddr) as *const u8,
                    buf[read..].as_mut_ptr(),
                    chunk,
                );
            }
            read += chunk;
        }
        Ok(())
    }

    /// Zero a byte range in this space; same page-walk contract as
    /// `write_bytes`.
    pub fn zero_bytes(&self, vaddr: VirtAddr, len: usize) -> Result<(), KernelError> {
        let mut done = 0usize;
        while done < len {
            let cur = vaddr + done as u64;
            let paddr = self.translate(cur).ok_or(KernelError::InvalidArgument)?;
            let in_page = (PAGE_SIZE - (cur.as_u64() & (PAGE_SIZE - 1))) as usize;
            let chunk = in_page.min(len - done);
            unsafe {
                core::ptr::write_bytes(phys_ptr(paddr), 0, chunk);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Install this space's root in CR3. Flushes the whole TLB.
    ///
    /// # Safety
    /// The tree must map the currently executing kernel code and stack.
    pub unsafe fn load(&self) {
        Cr3::write(self.root, Cr3Flags::empty());
    }

    /// Free every tracked page's frame and every intermediate table this
    /// space allocated, then mark the space destroyed. The root frame is
    /// deliberately left to the caller.
    pub fn destroy<D: FrameDeallocator<Size4KiB>>(&mut self, fa: &mut D) {
        let pages = core::mem::take(&mut self.pages);
        for vaddr in pages {
            if let Some(paddr) = self.translate(vaddr) {
                unsafe { fa.deallocate_frame(PhysFrame::containing_address(paddr)) };
            }
        }
        for frame in self.table_frames.drain(..) {
            unsafe { fa.deallocate_frame(frame) };
        }
        self.state = SpaceState::Destroyed;
    }
}

/// Invalidate a single TLB entry after changing one mapping in the live
/// space; cheaper than the full flush `load` implies.
pub fn flush_page(vaddr: VirtAddr) {
    x86_64::instructions::tlb::flush(vaddr);
}
