pub mod frame_allocator;
pub mod paging;

use frame_allocator::{BitmapFrameAllocator, MemoryRegion, RegionKind, ReserveFrame};
use lazy_static::lazy_static;
use paging::{AddressSpace, MapFlags, PAGE_SIZE};
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::errno::KernelError;
use crate::process::Process;

/// Global mutable state of the memory core. No finer locking exists below
/// these mutexes; single hardware thread, cooperative switching only.
lazy_static! {
    pub static ref FRAME_ALLOCATOR: Mutex<BitmapFrameAllocator> =
        Mutex::new(BitmapFrameAllocator::new());
}

pub static KERNEL_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

const MAX_REGIONS: usize = 32;

/// Virtual base where per-process DMA windows are placed.
const DMA_WINDOW_BASE: u64 = 0x7000_0000;

pub fn init(multiboot_info_addr: usize) {
    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
            .expect("Failed to load Multiboot2 info")
    };
    let memory_map_tag = boot_info.memory_map_tag().expect("Memory map tag required");

    // The heap does not exist yet, so the region list lives on the stack.
    let mut regions = [MemoryRegion { base: 0, length: 0, kind: RegionKind::Reserved }; MAX_REGIONS];
    let mut count = 0;

    for area in memory_map_tag.memory_areas() {
        if multiboot2::MemoryAreaType::from(area.typ()) != multiboot2::MemoryAreaType::Available {
            continue;
        }
        if count < MAX_REGIONS {
            regions[count] = MemoryRegion {
                base: area.start_address(),
                length: area.size(),
                kind: RegionKind::Available,
            };
            count += 1;
        }
    }

    // Re-reserve the kernel image, taken from the ELF sections the
    // bootloader left us, and the multiboot structures themselves.
    if let Some(sections) = boot_info.elf_sections() {
        let mut kernel_start = u64::MAX;
        let mut kernel_end = 0u64;
        for section in sections {
            if !section
                .flags()
                .contains(multiboot2::ElfSectionFlags::ALLOCATED)
            {
                continue;
            }
            kernel_start = kernel_start.min(section.start_address());
            kernel_end = kernel_end.max(section.end_address());
        }
        if kernel_start < kernel_end && count < MAX_REGIONS {
            regions[count] = MemoryRegion {
                base: kernel_start,
                length: kernel_end - kernel_start,
                kind: RegionKind::Reserved,
            };
            count += 1;
        }
    }
    if count < MAX_REGIONS {
        regions[count] = MemoryRegion {
            base: boot_info.start_address() as u64,
            length: (boot_info.end_address() - boot_info.start_address()) as u64,
            kind: RegionKind::Reserved,
        };
        count += 1;
    }

    {
        let mut fa = FRAME_ALLOCATOR.lock();
        fa.init(&regions[..count]);
        crate::log_info!(
            "Frame allocator initialized: {} frames free.",
            fa.free_frame_count()
        );
    }

    // The boot stub built the kernel table tree, including the full
    // physical window in the higher half; adopt it rather than rebuild it.
    let mut kernel = unsafe { AddressSpace::from_active() };

    crate::allocator::init_heap(&mut kernel, &mut *FRAME_ALLOCATOR.lock())
        .expect("Heap initialization failed");
    crate::log_info!("Kernel heap initialized.");

    // Boot modules become the root file images (the initramfs stand-in).
    // Module addresses are physical; reach them through the phys window.
    for module in boot_info.module_tags() {
        let bytes = unsafe {
            core::slice::from_raw_parts(
                paging::phys_ptr(PhysAddr::new(module.start_address() as u64)),
                (module.end_address() - module.start_address()) as usize,
            )
        };
        let name = module.cmdline().unwrap_or("/bin/init");
        crate::fs::VFS.lock().register(name, bytes);
        crate::log_info!("Registered boot module '{}' ({} bytes).", name, bytes.len());
    }

    *KERNEL_SPACE.lock() = Some(kernel);
    crate::log_info!("Virtual memory manager initialized.");
}

/// Run `f` with the kernel address space. Panics before `init`; every
/// caller runs strictly after boot.
pub fn with_kernel_space<R>(f: impl FnOnce(&mut AddressSpace) -> R) -> R {
    let mut guard = KERNEL_SPACE.lock();
    let space = guard.as_mut().expect("kernel address space not initialized");
    f(space)
}

/// Map a fixed physical range (framebuffer, device buffer) into a process
/// at the DMA window, claiming each frame so the generic allocator can
/// never hand it out. The window pages are recorded in the process's lazy
/// DMA page list. Runtime callers pass the locked `FRAME_ALLOCATOR`.
pub fn map_dma_window<A>(
    proc: &mut Process,
    phys_base: PhysAddr,
    pages: usize,
    fa: &mut A,
) -> Result<VirtAddr, KernelError>
where
    A: ReserveFrame + FrameAllocator<Size4KiB>,
{
    if !phys_base.is_aligned(PAGE_SIZE) {
        return Err(KernelError::InvalidArgument);
    }
    let base = VirtAddr::new(DMA_WINDOW_BASE + proc.dma_page_count() as u64 * PAGE_SIZE);
    for i in 0..pages {
        let paddr = phys_base + i as u64 * PAGE_SIZE;
        // Tolerate frames already reserved by the boot map; they are
        // exactly the ones a device window points at.
        match fa.allocate_at(paddr) {
            Ok(_) | Err(KernelError::AlreadyAllocated) => {}
            Err(e) => return Err(e),
        }
        let vaddr = base + i as u64 * PAGE_SIZE;
        proc.space
            .new_page(vaddr, paddr, MapFlags::WRITE | MapFlags::USER, fa)?;
        proc.track_dma_page(vaddr);
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessTable;
    use crate::test_support::{build_elf, ElfSegment, HostFrameAllocator};
    use x86_64::structures::paging::PageTableFlags;

    fn spawn_into(
        table: &mut ProcessTable,
        path: &str,
        fa: &mut HostFrameAllocator,
    ) -> crate::process::ProcessId {
        let image = build_elf(0x40_0000, &[ElfSegment::code(0x40_0000, b"\xeb\xfe")]);
        crate::fs::VFS
            .lock()
            .register(path, alloc::boxed::Box::leak(image.into_boxed_slice()));
        let kernel = AddressSpace::new(fa).unwrap();
        table.spawn(path, &[path], &[], &kernel, fa).unwrap()
    }

    #[test]
    fn dma_window_claims_and_records_pages() {
        let mut fa = HostFrameAllocator::new();
        let mut table = ProcessTable::new();
        let pid = spawn_into(&mut table, "/bin/dma", &mut fa);
        let proc = table.find_mut(pid).unwrap();

        // A device range partially reserved by the boot map is fine; the
        // window claims the rest and tolerates the overlap.
        let phys_base = PhysAddr::new(0xFD00_0000);
        fa.allocate_at(phys_base).unwrap();

        let base = map_dma_window(proc, phys_base, 2, &mut fa).unwrap();
        assert_eq!(base, VirtAddr::new(DMA_WINDOW_BASE));
        assert_eq!(proc.dma_page_count(), 2);
        for i in 0..2u64 {
            assert_eq!(
                proc.space.translate(base + i * PAGE_SIZE),
                Some(phys_base + i * PAGE_SIZE)
            );
        }
        let flags = proc.space.page_flags(base).unwrap();
        assert!(flags.contains(PageTableFlags::USER_ACCESSIBLE));
        assert!(flags.contains(PageTableFlags::WRITABLE));

        // A second window lands above the first.
        let second = map_dma_window(proc, PhysAddr::new(0xFE00_0000), 1, &mut fa).unwrap();
        assert_eq!(second, VirtAddr::new(DMA_WINDOW_BASE + 2 * PAGE_SIZE));
        assert_eq!(proc.dma_page_count(), 3);
    }

    #[test]
    fn dma_window_rejects_misaligned_base() {
        let mut fa = HostFrameAllocator::new();
        let mut table = ProcessTable::new();
        let pid = spawn_into(&mut table, "/bin/dma_misaligned", &mut fa);
        let proc = table.find_mut(pid).unwrap();

        assert_eq!(
            map_dma_window(proc, PhysAddr::new(0xFD00_0010), 1, &mut fa),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(proc.dma_page_count(), 0);
    }
}
