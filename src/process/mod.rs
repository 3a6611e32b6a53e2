//! Process objects and the process table (spawn / exec / mark-dead / reap).
//!
//! Resource freeing is two-phase by design: `mark_dead` only flips a
//! process into the `Zombie` state, and the actual teardown happens in
//! `try_kill`, called from the scheduler's pass once the victim is
//! guaranteed not to be the process whose kernel stack we are running on.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, Size4KiB},
    VirtAddr,
};

use crate::errno::KernelError;
use crate::loader::elf;
use crate::memory::paging::{AddressSpace, MapFlags, PAGE_SIZE};
use crate::scheduler::context::{user_entry, Context};

pub const MAX_PROCESSES: usize = 64;
pub const MAX_FDS: usize = 32;

/// One page of ring-0 stack per process, used only while the kernel runs
/// on this process's behalf.
pub const KERNEL_STACK_SIZE: usize = 4096;

pub const USER_STACK_PAGES: usize = 4;
pub const USER_STACK_TOP: u64 = 0x8000_0000;

/// argv/envp payload must leave most of the stack usable.
const ARG_AREA_LIMIT: usize = USER_STACK_PAGES * PAGE_SIZE as usize / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Runnable,
    Running,
    Zombie,
}

pub struct Process {
    pub pid: ProcessId,
    pub path: String,
    pub space: AddressSpace,
    pub state: ProcessState,
    pub exit_status: Option<i64>,
    /// Initial user entry point and stack pointer, consumed on first entry.
    pub entry_ip: VirtAddr,
    pub user_rsp: VirtAddr,
    pub user_stack_size: usize,
    pub context: Context,
    kernel_stack: Box<[u8]>,
    fd_used: [bool; MAX_FDS],
    fd_cursor: usize,
    dma_pages: Option<Vec<VirtAddr>>,
}

impl Process {
    /// Top of the ring-0 stack, 16-byte aligned, installed into TSS.RSP0
    /// whenever this process is switched to.
    pub fn kernel_stack_top(&self) -> u64 {
        (self.kernel_stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64) & !0xF
    }

    pub fn is_dead(&self) -> bool {
        self.state == ProcessState::Zombie
    }

    /// First-free scan from the cursor, wrapping once. Slots 0-2 are taken
    /// at spawn for the standard console descriptors.
    pub fn new_fd(&mut self) -> Result<usize, KernelError> {
        for step in 0..MAX_FDS {
            let fd = (self.fd_cursor + step) % MAX_FDS;
            if !self.fd_used[fd] {
                self.fd_used[fd] = true;
                self.fd_cursor = (fd + 1) % MAX_FDS;
                return Ok(fd);
            }
        }
        Err(KernelError::Exhausted)
    }

    pub fn free_fd(&mut self, fd: usize) -> Result<(), KernelError> {
        if fd >= MAX_FDS || !self.fd_used[fd] {
            return Err(KernelError::InvalidArgument);
        }
        self.fd_used[fd] = false;
        self.fd_cursor = fd;
        Ok(())
    }

    pub fn fd_in_use(&self, fd: usize) -> bool {
        fd < MAX_FDS && self.fd_used[fd]
    }

    /// The DMA page list is only materialized for processes that map a
    /// device window.
    pub fn track_dma_page(&mut self, vaddr: VirtAddr) {
        self.dma_pages.get_or_insert_with(Vec::new).push(vaddr);
    }

    pub fn dma_page_count(&self) -> usize {
        self.dma_pages.as_ref().map_or(0, |v| v.len())
    }
}

/// Everything spawn and exec share: a fresh kernel-mapped address space
/// with the image loaded and the user stack populated.
struct BuiltImage {
    space: AddressSpace,
    entry: VirtAddr,
    user_rsp: VirtAddr,
}

pub struct ProcessTable {
    slots: Vec<Option<Process>>,
    next_pid: u64,
}

lazy_static! {
    pub static ref PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
}

impl ProcessTable {
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(MAX_PROCESSES, || None);
        ProcessTable { slots, next_pid: 1 }
    }

    pub fn capacity(&self) -> usize {
        MAX_PROCESSES
    }

    /// Slot view for the scheduler's circular scan.
    pub fn state_at(&self, idx: usize) -> Option<(ProcessId, ProcessState)> {
        self.slots[idx].as_ref().map(|p| (p.pid, p.state))
    }

    pub fn find(&self, pid: ProcessId) -> Option<&Process> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .find(|p| p.pid == pid)
    }

    pub fn find_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.as_mut())
            .find(|p| p.pid == pid)
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    /// Create a process from the ELF image registered under `path`.
    pub fn spawn<A>(
        &mut self,
        path: &str,
        argv: &[&str],
        envp: &[&str],
        kernel: &AddressSpace,
        fa: &mut A,
    ) -> Result<ProcessId, KernelError>
    where
        A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let slot = self.free_slot().ok_or(KernelError::NoSpace)?;
        let built = build_image(path, argv, envp, kernel, fa)?;

        let kernel_stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;

        let mut fd_used = [false; MAX_FDS];
        fd_used[0] = true; // stdin
        fd_used[1] = true; // stdout
        fd_used[2] = true; // stderr

        let mut process = Process {
            pid,
            path: String::from(path),
            space: built.space,
            state: ProcessState::Runnable,
            exit_status: None,
            entry_ip: built.entry,
            user_rsp: built.user_rsp,
            user_stack_size: USER_STACK_PAGES * PAGE_SIZE as usize,
            context: Context::empty(),
            kernel_stack,
            fd_used,
            fd_cursor: 3,
            dma_pages: None,
        };
        process.context = first_entry_context(&process);

        self.slots[slot] = Some(process);
        Ok(pid)
    }

    /// Exec semantics: replace the image of an existing process in place,
    /// keeping its PID and kernel stack. On success the caller must never
    /// return into the old image; it jumps through the fresh context.
    pub fn replace<A>(
        &mut self,
        path: &str,
        argv: &[&str],
        envp: &[&str],
        pid: ProcessId,
        kernel: &AddressSpace,
        fa: &mut A,
    ) -> Result<(), KernelError>
    where
        A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        // Build the replacement completely before touching the old space,
        // so a bad path or image leaves the caller able to return an error.
        let built = build_image(path, argv, envp, kernel, fa)?;

        let proc = self.find_mut(pid).ok_or(KernelError::InvalidArgument)?;
        let mut old_space = core::mem::replace(&mut proc.space, built.space);
        old_space.destroy(fa);
        unsafe { fa.deallocate_frame(old_space.root_frame()) };

        proc.path = String::from(path);
        proc.entry_ip = built.entry;
        proc.user_rsp = built.user_rsp;
        proc.exit_status = None;
        proc.dma_pages = None;
        proc.context = first_entry_context(proc);
        Ok(())
    }

    /// Phase one of process death: flag only. The slot, address space and
    /// kernel stack all stay put until the scheduler reaps the zombie.
    pub fn mark_dead(&mut self, status: i64, pid: ProcessId) -> Result<(), KernelError> {
        let proc = self.find_mut(pid).ok_or(KernelError::InvalidArgument)?;
        proc.state = ProcessState::Zombie;
        proc.exit_status = Some(status);
        Ok(())
    }

    /// Phase two: free everything. Refuses self-kill, since the acting
    /// process is executing on the very kernel stack this would free.
    pub fn try_kill<D: FrameDeallocator<Size4KiB>>(
        &mut self,
        acting: ProcessId,
        target: ProcessId,
        fa: &mut D,
    ) -> Result<(), KernelError> {
        if acting == target {
            return Err(KernelError::InvalidArgument);
        }
        let slot = self
            .slots
            .iter()
            .position(|s| s.as_ref().map_or(false, |p| p.pid == target))
            .ok_or(KernelError::InvalidArgument)?;

        let mut proc = self.slots[slot].take().expect("slot vanished");
        proc.space.destroy(fa);
        unsafe { fa.deallocate_frame(proc.space.root_frame()) };
        crate::fs::VFS.lock().close_all(target);
        // Kernel stack and fd table go with the Process value itself.
        Ok(())
    }
}

/// Initial register state: enter at the ring-3 trampoline on the process's
/// kernel stack, with r12/r13 carrying the user entry point and stack.
fn first_entry_context(proc: &Process) -> Context {
    let mut ctx = Context::new(user_entry as usize as u64, proc.kernel_stack_top());
    ctx.r12 = proc.entry_ip.as_u64();
    ctx.r13 = proc.user_rsp.as_u64();
    ctx
}

fn build_image<A>(
    path: &str,
    argv: &[&str],
    envp: &[&str],
    kernel: &AddressSpace,
    fa: &mut A,
) -> Result<BuiltImage, KernelError>
where
    A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    let image = crate::fs::VFS.lock().lookup(path)?;

    let mut space = AddressSpace::new(fa)?;
    space.map_kernel_into(kernel);

    let result = (|| {
        let loaded = elf::load_into(image, &mut space, fa)?;

        let stack_top = VirtAddr::new(USER_STACK_TOP);
        for i in 1..=USER_STACK_PAGES as u64 {
            let page = stack_top - i * PAGE_SIZE;
            // An image whose segments reach into the stack region is
            // refused rather than mapped over.
            if space.translate(page).is_some() {
                return Err(KernelError::BadExecutable);
            }
            space.new_user_page(page, MapFlags::WRITE, fa)?;
        }
        let user_rsp = setup_user_stack(&space, stack_top, argv, envp)?;

        Ok((loaded.entry, user_rsp))
    })();

    match result {
        Ok((entry, user_rsp)) => Ok(BuiltImage { space, entry, user_rsp }),
        Err(e) => {
            space.destroy(fa);
            unsafe { fa.deallocate_frame(space.root_frame()) };
            Err(e)
        }
    }
}

/// Lay out argc/argv/envp at the top of the user stack, System V style:
/// the string bytes go highest, then the null-terminated pointer arrays,
/// then argc; the returned address is the initial user RSP pointing at
/// argc.
fn setup_user_stack(
    space: &AddressSpace,
    stack_top: VirtAddr,
    argv: &[&str],
    envp: &[&str],
) -> Result<VirtAddr, KernelError> {
    let strings: usize = argv.iter().chain(envp).map(|s| s.len() + 1).sum();
    let pointers = (argv.len() + 1 + envp.len() + 1 + 1) * 8;
    if strings + pointers + 16 > ARG_AREA_LIMIT {
        return Err(KernelError::InvalidArgument);
    }

    let mut cursor = stack_top;
    let mut argv_addrs = Vec::with_capacity(argv.len());
    let mut envp_addrs = Vec::with_capacity(envp.len());

    for (list, addrs) in [(argv, &mut argv_addrs), (envp, &mut envp_addrs)] {
        for s in list {
            cursor -= (s.len() + 1) as u64;
            space.write_bytes(cursor, s.as_bytes())?;
            space.write_bytes(cursor + s.len() as u64, &[0u8])?;
            addrs.push(cursor.as_u64());
        }
    }

    // Pointer block, 16-byte aligned: argc, argv..., 0, envp..., 0.
    let block_len = pointers;
    cursor = VirtAddr::new((cursor.as_u64() - block_len as u64) & !0xF);

    let mut block: Vec<u8> = Vec::with_capacity(block_len);
    block.extend_from_slice(&(argv.len() as u64).to_le_bytes());
    for addr in &argv_addrs {
        block.extend_from_slice(&addr.to_le_bytes());
    }
    block.extend_from_slice(&0u64.to_le_bytes());
    for addr in &envp_addrs {
        block.extend_from_slice(&addr.to_le_bytes());
    }
    block.extend_from_slice(&0u64.to_le_bytes());
    space.write_bytes(cursor, &block)?;

    Ok(cursor)
}
