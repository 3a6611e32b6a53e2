//! Syscall dispatcher, entered from the int 0x80 stub.
//!
//! User pointers are never dereferenced directly: every transfer goes
//! through the calling process's `AddressSpace`, which rejects unmapped
//! ranges, and kernel-half addresses are refused up front.

use alloc::string::String;
use alloc::vec::Vec;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::errno::KernelError;
use crate::log_warn;
use crate::memory::paging::{AddressSpace, PAGE_SIZE};
use crate::process::{ProcessId, PROCESS_TABLE};
use crate::scheduler::SCHEDULER;

pub const SYS_EXIT: u64 = 0;
pub const SYS_OPEN: u64 = 1;
pub const SYS_READ: u64 = 2;
pub const SYS_EXECVE: u64 = 3;

const PATH_MAX: usize = 1024;
const ARG_MAX: usize = 32;
const READ_MAX: usize = 64 * 1024;

/// First non-canonical address above the user half.
const USER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// Central dispatcher. rax=number, rdi/rsi/rdx=args, result in rax;
/// failures return the negated errno.
pub extern "C" fn dispatch(number: u64, a0: u64, a1: u64, a2: u64) -> u64 {
    match number {
        SYS_EXIT => sys_exit(a0 as i64),
        SYS_OPEN => ret(sys_open(a0)),
        SYS_READ => ret(sys_read(a0 as usize, a1, a2 as usize)),
        SYS_EXECVE => sys_execve(a0, a1, a2).errno() as u64,
        _ => {
            log_warn!("syscall: unknown number {}", number);
            KernelError::InvalidArgument.errno() as u64
        }
    }
}

fn ret(result: Result<u64, KernelError>) -> u64 {
    match result {
        Ok(v) => v,
        Err(e) => e.errno() as u64,
    }
}

fn current() -> Result<ProcessId, KernelError> {
    SCHEDULER.lock().current().ok_or(KernelError::InvalidArgument)
}

fn check_user_range(base: u64, len: usize) -> Result<(), KernelError> {
    let end = base.checked_add(len as u64).ok_or(KernelError::InvalidArgument)?;
    if base == 0 || end > USER_HALF_END {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
}

/// Destination check for syscalls that write into user memory: every
/// touched page must be mapped writable and user-accessible. The kernel
/// copies through the physical window, so the leaf flags have to be
/// checked here rather than relied on to fault.
fn check_user_writable(space: &AddressSpace, base: u64, len: usize) -> Result<(), KernelError> {
    check_user_range(base, len)?;
    let mut page = base & !(PAGE_SIZE - 1);
    let end = base + len as u64;
    while page < end {
        let flags = space
            .page_flags(VirtAddr::new(page))
            .ok_or(KernelError::InvalidArgument)?;
        if !flags.contains(PageTableFlags::WRITABLE)
            || !flags.contains(PageTableFlags::USER_ACCESSIBLE)
        {
            return Err(KernelError::InvalidArgument);
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Copy a NUL-terminated string out of `space`. Byte-at-a-time so a
/// string ending at a mapping boundary is still accepted.
fn user_str(space: &AddressSpace, ptr: u64) -> Result<String, KernelError> {
    check_user_range(ptr, PATH_MAX)?;
    let mut bytes = Vec::new();
    for i in 0..PATH_MAX as u64 {
        let mut byte = [0u8; 1];
        space.read_bytes(VirtAddr::new(ptr + i), &mut byte)?;
        if byte[0] == 0 {
            return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument);
        }
        bytes.push(byte[0]);
    }
    Err(KernelError::InvalidArgument)
}

/// Copy a NULL-terminated pointer array of strings (argv/envp shape).
/// A null array pointer reads as empty.
fn user_str_list(space: &AddressSpace, ptr: u64) -> Result<Vec<String>, KernelError> {
    if ptr == 0 {
        return Ok(Vec::new());
    }
    check_user_range(ptr, (ARG_MAX + 1) * 8)?;
    let mut list = Vec::new();
    for i in 0..=ARG_MAX as u64 {
        let mut entry = [0u8; 8];
        space.read_bytes(VirtAddr::new(ptr + i * 8), &mut entry)?;
        let addr = u64::from_le_bytes(entry);
        if addr == 0 {
            return Ok(list);
        }
        list.push(user_str(space, addr)?);
    }
    Err(KernelError::InvalidArgument)
}

fn sys_exit(status: i64) -> ! {
    if let Ok(pid) = current() {
        let _ = PROCESS_TABLE.lock().mark_dead(status, pid);
    }
    crate::scheduler::yield_now()
}

fn sys_open(path_ptr: u64) -> Result<u64, KernelError> {
    let pid = current()?;
    let mut table = PROCESS_TABLE.lock();
    let proc = table.find_mut(pid).ok_or(KernelError::InvalidArgument)?;
    let path = user_str(&proc.space, path_ptr)?;

    crate::fs::VFS.lock().lookup(&path)?;
    let fd = proc.new_fd()?;
    if let Err(e) = crate::fs::VFS.lock().open(pid, fd, &path) {
        let _ = proc.free_fd(fd);
        return Err(e);
    }
    Ok(fd as u64)
}

fn sys_read(fd: usize, buf: u64, len: usize) -> Result<u64, KernelError> {
    let pid = current()?;
    let mut table = PROCESS_TABLE.lock();
    let proc = table.find_mut(pid).ok_or(KernelError::InvalidArgument)?;
    if !proc.fd_in_use(fd) {
        return Err(KernelError::InvalidArgument);
    }
    let len = len.min(READ_MAX);
    check_user_writable(&proc.space, buf, len)?;

    let mut total = 0usize;
    let mut chunk = [0u8; 512];
    while total < len {
        let want = chunk.len().min(len - total);
        let n = crate::fs::VFS.lock().read_fd(pid, fd, &mut chunk[..want])?;
        if n == 0 {
            break;
        }
        proc.space
            .write_bytes(VirtAddr::new(buf + total as u64), &chunk[..n])?;
        total += n;
        if n < want {
            break;
        }
    }
    Ok(total as u64)
}

/// Replace the calling process's image. Diverges into the new image on
/// success; only the error path returns.
fn sys_execve(path_ptr: u64, argv_ptr: u64, envp_ptr: u64) -> KernelError {
    let pid = match current() {
        Ok(pid) => pid,
        Err(e) => return e,
    };

    // Everything the new image needs is copied into kernel-owned memory
    // before the old address space is torn down.
    let copied = {
        let table = PROCESS_TABLE.lock();
        let proc = match table.find(pid) {
            Some(p) => p,
            None => return KernelError::InvalidArgument,
        };
        user_str(&proc.space, path_ptr).and_then(|path| {
            let argv = user_str_list(&proc.space, argv_ptr)?;
            let envp = user_str_list(&proc.space, envp_ptr)?;
            Ok((path, argv, envp))
        })
    };
    let (path, argv, envp) = match copied {
        Ok(v) => v,
        Err(e) => return e,
    };

    let replaced = {
        let mut table = PROCESS_TABLE.lock();
        crate::memory::with_kernel_space(|kernel| {
            let mut fa = crate::memory::FRAME_ALLOCATOR.lock();
            let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
            let envp_refs: Vec<&str> = envp.iter().map(String::as_str).collect();
            table.replace(&path, &argv_refs, &envp_refs, pid, kernel, &mut *fa)
        })
    };
    match replaced {
        Ok(()) => crate::scheduler::switch_to(pid),
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::MapFlags;
    use crate::test_support::HostFrameAllocator;
    use x86_64::structures::paging::FrameAllocator;

    fn space_with_page(fa: &mut HostFrameAllocator, vaddr: u64) -> AddressSpace {
        let mut space = AddressSpace::new(fa).unwrap();
        let frame = fa.allocate_frame().unwrap();
        space
            .new_page(
                VirtAddr::new(vaddr),
                frame.start_address(),
                MapFlags::WRITE | MapFlags::USER,
                fa,
            )
            .unwrap();
        space
    }

    #[test]
    fn user_str_round_trips() {
        let mut fa = HostFrameAllocator::new();
        let space = space_with_page(&mut fa, 0x1000);
        space.write_bytes(VirtAddr::new(0x1100), b"/bin/sh\0").unwrap();
        assert_eq!(user_str(&space, 0x1100).unwrap(), "/bin/sh");
    }

    #[test]
    fn user_str_rejects_unterminated_and_unmapped() {
        let mut fa = HostFrameAllocator::new();
        let space = space_with_page(&mut fa, 0x1000);
        // No NUL anywhere in reach.
        space.write_bytes(VirtAddr::new(0x1000), &[b'a'; 4096]).unwrap();
        assert!(user_str(&space, 0x1000).is_err());
        // Entirely unmapped pointer.
        assert!(user_str(&space, 0x5000).is_err());
    }

    #[test]
    fn user_ranges_outside_the_user_half_are_refused() {
        assert!(check_user_range(0, 16).is_err());
        assert!(check_user_range(0xFFFF_8000_0000_0000, 16).is_err());
        assert!(check_user_range(u64::MAX - 4, 16).is_err());
        assert!(check_user_range(0x1000, 16).is_ok());
    }

    #[test]
    fn write_destinations_must_be_user_writable() {
        let mut fa = HostFrameAllocator::new();
        let mut space = AddressSpace::new(&mut fa).unwrap();
        let ro = fa.allocate_frame().unwrap();
        space
            .new_page(VirtAddr::new(0x1000), ro.start_address(), MapFlags::USER, &mut fa)
            .unwrap();
        let rw = fa.allocate_frame().unwrap();
        space
            .new_page(
                VirtAddr::new(0x2000),
                rw.start_address(),
                MapFlags::WRITE | MapFlags::USER,
                &mut fa,
            )
            .unwrap();
        let kernel_only = fa.allocate_frame().unwrap();
        space
            .new_page(
                VirtAddr::new(0x3000),
                kernel_only.start_address(),
                MapFlags::WRITE,
                &mut fa,
            )
            .unwrap();

        assert!(check_user_writable(&space, 0x2000, 16).is_ok());
        // Read-only text page.
        assert!(check_user_writable(&space, 0x1000, 16).is_err());
        // Writable but not user-accessible.
        assert!(check_user_writable(&space, 0x3000, 16).is_err());
        // A range spilling from a writable page into a refused one.
        assert!(check_user_writable(&space, 0x2FF0, 32).is_err());
    }

    #[test]
    fn user_str_list_reads_argv_shape() {
        let mut fa = HostFrameAllocator::new();
        let space = space_with_page(&mut fa, 0x1000);
        space.write_bytes(VirtAddr::new(0x1000), b"one\0two\0").unwrap();
        let mut table = Vec::new();
        table.extend_from_slice(&0x1000u64.to_le_bytes());
        table.extend_from_slice(&0x1004u64.to_le_bytes());
        table.extend_from_slice(&0u64.to_le_bytes());
        space.write_bytes(VirtAddr::new(0x1800), &table).unwrap();

        let list = user_str_list(&space, 0x1800).unwrap();
        assert_eq!(list, ["one", "two"]);
        assert_eq!(user_str_list(&space, 0).unwrap().len(), 0);
    }
}
