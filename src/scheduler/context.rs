use core::arch::naked_asm;

/// Callee-saved register state of a suspended process (System V x86_64).
/// Only ever restored, never saved: a process reenters the kernel through
/// its interrupt frame, not through a cooperative save.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    pub fn empty() -> Self {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
        }
    }

    /// Fresh context entering `entry` on `stack_top`. The stack pointer is
    /// 16-byte aligned minus 8, matching the state after a call.
    pub fn new(entry: u64, stack_top: u64) -> Self {
        let aligned_sp = (stack_top & !0xF) - 8;
        Context {
            rsp: aligned_sp,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: entry,
        }
    }
}

/// Discard the current CPU state and become `new`.
///
/// # Safety
/// `new` must point at a valid context whose stack and RIP are live.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(new: *const Context) -> ! {
    naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "jmp [rdi + 0x38]",
    );
}

/// Ring-0 entry point of a process that has never run. The context builder
/// plants the user entry point in R12 and the user stack pointer in R13;
/// this stub loads the ring-3 selectors and irets into the user half.
///
/// user_cs = 0x23 (GDT index 4, RPL 3), user_ss = 0x1B (index 3, RPL 3).
#[unsafe(naked)]
pub extern "C" fn user_entry() {
    naked_asm!(
        "mov ax, 0x1B",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "push 0x1B",   // SS
        "push r13",    // RSP
        "push 0x202",  // RFLAGS, IF set
        "push 0x23",   // CS
        "push r12",    // RIP
        "iretq",
    );
}
