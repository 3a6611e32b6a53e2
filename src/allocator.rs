use linked_list_allocator::LockedHeap;
use x86_64::{
    structures::paging::{FrameAllocator, Size4KiB},
    VirtAddr,
};

use crate::errno::KernelError;
use crate::memory::paging::{AddressSpace, MapFlags, PAGE_SIZE};

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Higher-half window reserved for the kernel heap.
pub const HEAP_START: u64 = 0xFFFF_8888_0000_0000;
pub const HEAP_SIZE: usize = 1024 * 1024; // 1 MiB

/// Map the kernel heap window and hand it to the allocator. Runs once,
/// right after the frame allocator comes up.
pub fn init_heap<A: FrameAllocator<Size4KiB>>(
    kernel: &mut AddressSpace,
    fa: &mut A,
) -> Result<(), KernelError> {
    for offset in (0..HEAP_SIZE as u64).step_by(PAGE_SIZE as usize) {
        let frame = fa.allocate_frame().ok_or(KernelError::NoMemory)?;
        kernel.new_page(
            VirtAddr::new(HEAP_START + offset),
            frame.start_address(),
            MapFlags::WRITE,
            fa,
        )?;
    }
    unsafe {
        ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
    }
    Ok(())
}
