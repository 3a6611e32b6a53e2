use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::VirtAddr;

use super::gdt;
use crate::process::PROCESS_TABLE;
use crate::scheduler::SCHEDULER;
use crate::{log_error, log_warn, println};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Exit statuses planted on processes killed by a fault.
const STATUS_SEGFAULT: i64 = -11;
const STATUS_ILLEGAL: i64 = -4;
const STATUS_PROTECTION: i64 = -13;

pub type IrqHandler = fn(line: u8);

/// One slot per legacy PIC line. Drivers claim a line with
/// `register_irq_isr` and acknowledge with `irq_done`.
static IRQ_HANDLERS: Mutex<[Option<IrqHandler>; 16]> = Mutex::new([None; 16]);

pub fn register_irq_isr(line: u8, handler: IrqHandler) {
    IRQ_HANDLERS.lock()[line as usize] = Some(handler);
}

/// Send end-of-interrupt for `line`. Every IRQ handler must call this
/// before returning.
pub fn irq_done(line: u8) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + line);
    }
}

fn irq_dispatch(line: u8) {
    let handler = IRQ_HANDLERS.lock()[line as usize];
    match handler {
        Some(h) => h(line),
        None => {
            log_warn!("interrupts: spurious irq {}", line);
            irq_done(line);
        }
    }
}

macro_rules! irq_stub {
    ($name:ident, $line:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            irq_dispatch($line);
        }
    };
}

irq_stub!(irq0_handler, 0);
irq_stub!(irq1_handler, 1);
irq_stub!(irq2_handler, 2);
irq_stub!(irq3_handler, 3);
irq_stub!(irq4_handler, 4);
irq_stub!(irq5_handler, 5);
irq_stub!(irq6_handler, 6);
irq_stub!(irq7_handler, 7);
irq_stub!(irq8_handler, 8);
irq_stub!(irq9_handler, 9);
irq_stub!(irq10_handler, 10);
irq_stub!(irq11_handler, 11);
irq_stub!(irq12_handler, 12);
irq_stub!(irq13_handler, 13);
irq_stub!(irq14_handler, 14);
irq_stub!(irq15_handler, 15);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }

        let stubs: [extern "x86-interrupt" fn(InterruptStackFrame); 16] = [
            irq0_handler, irq1_handler, irq2_handler, irq3_handler,
            irq4_handler, irq5_handler, irq6_handler, irq7_handler,
            irq8_handler, irq9_handler, irq10_handler, irq11_handler,
            irq12_handler, irq13_handler, irq14_handler, irq15_handler,
        ];
        for (line, stub) in stubs.iter().enumerate() {
            idt[PIC_1_OFFSET as usize + line].set_handler_fn(*stub);
        }

        // Syscall gate, reachable from ring 3.
        unsafe {
            idt[0x80]
                .set_handler_addr(VirtAddr::new(
                    super::usermode::syscall_entry as *const () as u64,
                ))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }

        idt
    };
}

pub fn init() {
    IDT.load();
}

/// Kill the faulting user process and never return to it. A fault with no
/// process running means the kernel itself tripped.
fn kill_current(status: i64, what: &str) -> ! {
    let pid = SCHEDULER.lock().current();
    match pid {
        Some(pid) => {
            log_error!("{}: killing pid {}", what, pid.0);
            let _ = PROCESS_TABLE.lock().mark_dead(status, pid);
            crate::scheduler::yield_now()
        }
        None => panic!("{} before any process started", what),
    }
}

fn from_user(stack_frame: &InterruptStackFrame) -> bool {
    stack_frame.code_segment & 3 == 3
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    if from_user(&stack_frame) {
        kill_current(STATUS_ILLEGAL, "invalid opcode");
    }
    panic!("EXCEPTION: INVALID OPCODE IN KERNEL\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    if from_user(&stack_frame) {
        log_error!("general protection fault, error code {:#x}", error_code);
        kill_current(STATUS_PROTECTION, "general protection fault");
    }
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT\nError Code: {:#x}\n{:#?}",
        error_code, stack_frame
    );
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let addr = Cr2::read();
    let action = if error_code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
        "fetch"
    } else if error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
        "write"
    } else {
        "read"
    };
    let reason = if error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
        "protection violation"
    } else {
        "page not present"
    };

    if error_code.contains(PageFaultErrorCode::USER_MODE) {
        log_error!("page fault: {} at {:?}, {}", action, addr, reason);
        kill_current(STATUS_SEGFAULT, "page fault");
    }
    panic!(
        "EXCEPTION: PAGE FAULT IN KERNEL\n{} at {:?}, {}\n{:#?}",
        action, addr, reason, stack_frame
    );
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}
