use lazy_static::lazy_static;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Ring-0 stack used for traps taken before the first process runs.
/// Once scheduling starts, RSP0 is repointed at the current process's
/// kernel stack on every switch.
const BOOT_RSP0_SIZE: usize = 4096 * 4;
static mut BOOT_RSP0_STACK: [u8; BOOT_RSP0_SIZE] = [0; BOOT_RSP0_SIZE];

/// Dedicated stack for the double-fault handler, reached through the IST
/// so a corrupt RSP0 cannot take it down too.
const DF_STACK_SIZE: usize = 4096 * 4;
static mut DF_STACK: [u8; DF_STACK_SIZE] = [0; DF_STACK_SIZE];

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let start = VirtAddr::from_ptr(unsafe { &raw const DF_STACK });
            start + DF_STACK_SIZE as u64
        };
        tss.privilege_stack_table[0] = {
            let start = VirtAddr::from_ptr(unsafe { &raw const BOOT_RSP0_STACK });
            start + BOOT_RSP0_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    // Entry order is load-bearing: the ring-3 entry trampoline and the
    // int 0x80 return path assume user_data = 0x1B and user_code = 0x23.
    pub static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_data = gdt.add_entry(Descriptor::user_data_segment());
        let user_code = gdt.add_entry(Descriptor::user_code_segment());
        let tss = gdt.add_entry(Descriptor::tss_segment(&TSS));
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_code,
                user_data,
                tss,
            },
        )
    };
}

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS, DS, SS};
    use x86_64::instructions::tables::load_tss;

    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// User code selector with RPL 3 (0x23 given the entry order above).
pub fn user_code_selector() -> SegmentSelector {
    SegmentSelector::new(GDT.1.user_code.index(), x86_64::PrivilegeLevel::Ring3)
}

/// User data selector with RPL 3 (0x1B).
pub fn user_data_selector() -> SegmentSelector {
    SegmentSelector::new(GDT.1.user_data.index(), x86_64::PrivilegeLevel::Ring3)
}

/// Point TSS.RSP0 at the kernel stack of the process about to run, so
/// ring-3 traps land on its own ring-0 stack.
pub fn set_tss_rsp0(kernel_stack_top: u64) {
    unsafe {
        // The CPU reads the TSS asynchronously; this single write is done
        // with interrupts disabled during the switch.
        let tss = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss).privilege_stack_table[0] = VirtAddr::new(kernel_stack_top);
    }
}
