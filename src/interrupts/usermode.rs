//! The int 0x80 entry path.
//!
//! Convention: RAX = syscall number, RDI/RSI/RDX = arguments, result
//! comes back in RAX. Anything else the user had is preserved.

use core::arch::naked_asm;

/// Raw gate target. Spills the caller's registers, reshuffles the
/// argument registers into the System V positions for the Rust
/// dispatcher, and irets back with the result in RAX.
///
/// Syscalls that never return (exit, execve) leave through the scheduler
/// instead of falling out the bottom of this stub; their spilled frame is
/// abandoned with the rest of the kernel stack.
#[unsafe(naked)]
pub extern "C" fn syscall_entry() {
    naked_asm!(
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbx",
        "push rcx",

        // CPU pushed 5 qwords, we pushed 14: one more to hit 16-byte
        // alignment at the call.
        "sub rsp, 8",

        // dispatch(number=rax, a0=rdi, a1=rsi, a2=rdx)
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",
        "call {dispatch}",

        "add rsp, 8",

        // RAX carries the result back to the user.
        "pop rcx",
        "pop rbx",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",

        "iretq",
        dispatch = sym crate::syscalls::dispatch,
    );
}
