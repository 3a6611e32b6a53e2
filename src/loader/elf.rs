use alloc::vec::Vec;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, Size4KiB},
    VirtAddr,
};

use crate::errno::KernelError;
use crate::memory::paging::{AddressSpace, MapFlags, PAGE_SIZE};

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;

/// User images must stay in the canonical lower half.
const USER_ADDR_LIMIT: u64 = 0x0000_7FFF_FFFF_F000;

// ══════════════════════════════════════════════════════════════
//  ELF64 structures
// ══════════════════════════════════════════════════════════════

struct Elf64Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf64Ehdr {
    fn parse(data: &[u8]) -> Result<Self, KernelError> {
        if data.len() < 64 {
            return Err(KernelError::BadExecutable);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(KernelError::BadExecutable);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(KernelError::BadExecutable);
        }

        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        if e_type != ET_EXEC || e_machine != EM_X86_64 {
            return Err(KernelError::BadExecutable);
        }

        Ok(Elf64Ehdr {
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        })
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Elf64Phdr {
    fn parse(data: &[u8]) -> Result<Self, KernelError> {
        if data.len() < 56 {
            return Err(KernelError::BadExecutable);
        }
        Ok(Elf64Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }

    fn map_flags(&self) -> MapFlags {
        let mut flags = MapFlags::USER;
        if self.p_flags & PF_W != 0 {
            flags |= MapFlags::WRITE;
        }
        if self.p_flags & PF_X != 0 {
            flags |= MapFlags::EXECUTE;
        }
        flags
    }
}

// ══════════════════════════════════════════════════════════════
//  Loader
// ══════════════════════════════════════════════════════════════

/// Result of loading an image into an address space.
pub struct LoadedImage {
    pub entry: VirtAddr,
    /// (base, length) of every PT_LOAD segment, for diagnostics.
    pub segments: Vec<(VirtAddr, u64)>,
}

/// Map and copy the PT_LOAD segments of `image` into `space`, which must
/// already exist (and carry the kernel mapping). The copy goes through the
/// target's own page tables, so no CR3 switching happens mid-load.
pub fn load_into<A>(
    image: &[u8],
    space: &mut AddressSpace,
    fa: &mut A,
) -> Result<LoadedImage, KernelError>
where
    A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    let ehdr = Elf64Ehdr::parse(image)?;
    let mut segments = Vec::new();

    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
        if off + 56 > image.len() {
            return Err(KernelError::BadExecutable);
        }
        let phdr = Elf64Phdr::parse(&image[off..])?;
        if phdr.p_type != PT_LOAD || phdr.p_memsz == 0 {
            continue;
        }
        if phdr.p_memsz < phdr.p_filesz
            || phdr.p_vaddr.checked_add(phdr.p_memsz).is_none()
            || phdr.p_vaddr + phdr.p_memsz > USER_ADDR_LIMIT
        {
            return Err(KernelError::BadExecutable);
        }
        let file_end = phdr.p_offset.checked_add(phdr.p_filesz).ok_or(KernelError::BadExecutable)?;
        if file_end as usize > image.len() {
            return Err(KernelError::BadExecutable);
        }

        let first_page = phdr.p_vaddr & !(PAGE_SIZE - 1);
        let last_page = (phdr.p_vaddr + phdr.p_memsz + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let flags = phdr.map_flags();
        for page in (first_page..last_page).step_by(PAGE_SIZE as usize) {
            let vaddr = VirtAddr::new(page);
            // Adjacent segments may share a boundary page.
            if space.translate(vaddr).is_none() {
                space.new_user_page(vaddr, flags, fa)?;
                space.zero_bytes(vaddr, PAGE_SIZE as usize)?;
            }
        }

        space.write_bytes(
            VirtAddr::new(phdr.p_vaddr),
            &image[phdr.p_offset as usize..file_end as usize],
        )?;
        segments.push((VirtAddr::new(phdr.p_vaddr), phdr.p_memsz));
    }

    if segments.is_empty() {
        return Err(KernelError::BadExecutable);
    }

    Ok(LoadedImage {
        entry: VirtAddr::new(ehdr.e_entry),
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{build_elf, ElfSegment, HostFrameAllocator};

    #[test]
    fn rejects_bad_magic() {
        let mut fa = HostFrameAllocator::new();
        let mut space = AddressSpace::new(&mut fa).unwrap();
        let mut image = build_elf(0x40_0000, &[ElfSegment::code(0x40_0000, b"\x90")]);
        image[0] = 0x00;
        assert_eq!(
            load_into(&image, &mut space, &mut fa).err(),
            Some(KernelError::BadExecutable)
        );
    }

    #[test]
    fn rejects_32bit_class() {
        let mut fa = HostFrameAllocator::new();
        let mut space = AddressSpace::new(&mut fa).unwrap();
        let mut image = build_elf(0x40_0000, &[ElfSegment::code(0x40_0000, b"\x90")]);
        image[4] = 1;
        assert_eq!(
            load_into(&image, &mut space, &mut fa).err(),
            Some(KernelError::BadExecutable)
        );
    }

    #[test]
    fn maps_segments_and_copies_bytes() {
        let mut fa = HostFrameAllocator::new();
        let mut space = AddressSpace::new(&mut fa).unwrap();
        let text = b"\x48\xc7\xc0\x3c\x00\x00\x00";
        let image = build_elf(
            0x40_0000,
            &[
                ElfSegment::code(0x40_0000, text),
                ElfSegment::data(0x60_0000, b"abcd", 4096),
            ],
        );
        let loaded = load_into(&image, &mut space, &mut fa).unwrap();
        assert_eq!(loaded.entry, VirtAddr::new(0x40_0000));
        assert_eq!(loaded.segments.len(), 2);

        let text_phys = space.translate(VirtAddr::new(0x40_0000)).unwrap();
        let data_phys = space.translate(VirtAddr::new(0x60_0000)).unwrap();
        assert_ne!(text_phys, data_phys);

        let copied = unsafe { core::slice::from_raw_parts(text_phys.as_u64() as *const u8, text.len()) };
        assert_eq!(copied, text);

        // bss tail of the data segment is zeroed.
        let tail = unsafe { *((data_phys.as_u64() + 100) as *const u8) };
        assert_eq!(tail, 0);
    }

    #[test]
    fn segment_permissions_follow_phdr_flags() {
        use x86_64::structures::paging::PageTableFlags;
        let mut fa = HostFrameAllocator::new();
        let mut space = AddressSpace::new(&mut fa).unwrap();
        let image = build_elf(
            0x40_0000,
            &[
                ElfSegment::code(0x40_0000, b"\x90"),
                ElfSegment::data(0x60_0000, b"abcd", 4096),
            ],
        );
        load_into(&image, &mut space, &mut fa).unwrap();

        let text_flags = space.page_flags(VirtAddr::new(0x40_0000)).unwrap();
        assert!(!text_flags.contains(PageTableFlags::NO_EXECUTE));
        assert!(!text_flags.contains(PageTableFlags::WRITABLE));

        let data_flags = space.page_flags(VirtAddr::new(0x60_0000)).unwrap();
        assert!(data_flags.contains(PageTableFlags::NO_EXECUTE));
        assert!(data_flags.contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn rejects_image_with_no_load_segments() {
        let mut fa = HostFrameAllocator::new();
        let mut space = AddressSpace::new(&mut fa).unwrap();
        let image = build_elf(0x40_0000, &[]);
        assert_eq!(
            load_into(&image, &mut space, &mut fa).err(),
            Some(KernelError::BadExecutable)
        );
    }
}
