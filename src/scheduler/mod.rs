//! Cooperative round-robin scheduler.
//!
//! There is no timer preemption; control returns to the scheduler only
//! when a process exits, execs or yields. Switching is always one-way:
//! the outgoing CPU state is discarded and the incoming process resumes
//! either at its ring-3 entry trampoline or at the interrupt frame it
//! trapped through.

pub mod context;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::structures::paging::{FrameDeallocator, Size4KiB};

use crate::log_info;
use crate::process::{ProcessId, ProcessState, ProcessTable, PROCESS_TABLE};

pub struct Scheduler {
    current: Option<ProcessId>,
    cursor: usize,
}

lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            current: None,
            cursor: 0,
        }
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.current
    }

    /// Pick the next runnable process, circularly from just past the last
    /// pick. Zombies encountered on the way are reaped, except the current
    /// process itself, whose kernel stack we may still be standing on.
    ///
    /// Returns `None` when nothing is runnable.
    pub fn advance<D: FrameDeallocator<Size4KiB>>(
        &mut self,
        table: &mut ProcessTable,
        fa: &mut D,
    ) -> Option<ProcessId> {
        let n = table.capacity();
        let mut picked = None;

        for step in 1..=n {
            let idx = (self.cursor + step) % n;
            match table.state_at(idx) {
                Some((pid, ProcessState::Zombie)) => {
                    if self.current != Some(pid) {
                        let acting = self.current.unwrap_or(ProcessId(0));
                        let _ = table.try_kill(acting, pid, fa);
                    }
                }
                Some((pid, _)) if picked.is_none() => {
                    picked = Some((idx, pid));
                    // Keep scanning so zombies behind the pick still get
                    // reaped this round.
                }
                _ => {}
            }
        }

        let (idx, pid) = picked?;
        if let Some(prev) = self.current {
            if prev != pid {
                if let Some(p) = table.find_mut(prev) {
                    if p.state == ProcessState::Running {
                        p.state = ProcessState::Runnable;
                    }
                }
            }
        }
        if let Some(p) = table.find_mut(pid) {
            p.state = ProcessState::Running;
        }
        self.cursor = idx;
        self.current = Some(pid);
        Some(pid)
    }
}

/// Enter the first process. Called once at the end of boot, after PID 1
/// has been spawned.
pub fn start() -> ! {
    let pid = {
        let mut table = PROCESS_TABLE.lock();
        let mut fa = crate::memory::FRAME_ALLOCATOR.lock();
        SCHEDULER.lock().advance(&mut table, &mut *fa)
    };
    match pid {
        Some(pid) => switch_to(pid),
        None => panic!("scheduler: no process to start"),
    }
}

/// Give up the CPU for good: pick someone else and become them. The
/// caller's own state is not saved, so this is only reached from paths
/// that rebuilt the caller's context (exit, exec) beforehand.
pub fn yield_now() -> ! {
    let next = {
        let mut table = PROCESS_TABLE.lock();
        let mut fa = crate::memory::FRAME_ALLOCATOR.lock();
        SCHEDULER.lock().advance(&mut table, &mut *fa)
    };
    match next {
        Some(pid) => switch_to(pid),
        None => {
            log_info!("scheduler: nothing runnable, halting");
            loop {
                x86_64::instructions::hlt();
            }
        }
    }
}

/// Load the target's address space and resume its saved context. Also the
/// exec tail: after `replace` the same PID reenters through its fresh
/// context.
pub(crate) fn switch_to(pid: ProcessId) -> ! {
    let ctx = {
        let mut table = PROCESS_TABLE.lock();
        let proc = match table.find_mut(pid) {
            Some(p) => p,
            None => panic!("scheduler: switch to unknown pid {}", pid.0),
        };
        crate::interrupts::gdt::set_tss_rsp0(proc.kernel_stack_top());
        unsafe { proc.space.load() };
        proc.context
    };
    unsafe { context::restore_context(&ctx) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::AddressSpace;
    use crate::test_support::{build_elf, ElfSegment, HostFrameAllocator};

    fn spawn(table: &mut ProcessTable, path: &str, fa: &mut HostFrameAllocator) -> ProcessId {
        let image = build_elf(0x40_0000, &[ElfSegment::code(0x40_0000, b"\xeb\xfe")]);
        crate::fs::VFS
            .lock()
            .register(path, alloc::boxed::Box::leak(image.into_boxed_slice()));
        let kernel = AddressSpace::new(fa).unwrap();
        table.spawn(path, &[path], &[], &kernel, fa).unwrap()
    }

    #[test]
    fn empty_table_has_nothing_to_run() {
        let mut fa = HostFrameAllocator::new();
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();
        assert_eq!(sched.advance(&mut table, &mut fa), None);
        assert_eq!(sched.current(), None);
    }

    #[test]
    fn single_process_is_picked_repeatedly() {
        let mut fa = HostFrameAllocator::new();
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();
        let pid = spawn(&mut table, "/bin/sched_solo", &mut fa);

        assert_eq!(sched.advance(&mut table, &mut fa), Some(pid));
        assert_eq!(table.find(pid).unwrap().state, ProcessState::Running);
        assert_eq!(sched.advance(&mut table, &mut fa), Some(pid));
    }

    #[test]
    fn two_processes_alternate() {
        let mut fa = HostFrameAllocator::new();
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();
        let a = spawn(&mut table, "/bin/sched_a", &mut fa);
        let b = spawn(&mut table, "/bin/sched_b", &mut fa);

        let first = sched.advance(&mut table, &mut fa).unwrap();
        let second = sched.advance(&mut table, &mut fa).unwrap();
        let third = sched.advance(&mut table, &mut fa).unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
        assert!(first == a || first == b);

        // The one not running is back to Runnable.
        assert_eq!(table.find(third).unwrap().state, ProcessState::Running);
        assert_eq!(table.find(second).unwrap().state, ProcessState::Runnable);
    }

    #[test]
    fn zombies_are_skipped_and_reaped() {
        let mut fa = HostFrameAllocator::new();
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();
        let a = spawn(&mut table, "/bin/sched_dies", &mut fa);
        let b = spawn(&mut table, "/bin/sched_lives", &mut fa);

        let first = sched.advance(&mut table, &mut fa).unwrap();
        let other = if first == a { b } else { a };
        table.mark_dead(7, first).unwrap();

        // The zombie is never selected, and once the current hat moves to
        // the survivor the pass after reaps it entirely.
        assert_eq!(sched.advance(&mut table, &mut fa), Some(other));
        assert_eq!(sched.advance(&mut table, &mut fa), Some(other));
        assert_eq!(table.live_count(), 1);
        assert!(table.find(first).is_none());
    }

    #[test]
    fn current_zombie_is_not_reaped_while_current() {
        let mut fa = HostFrameAllocator::new();
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();
        let a = spawn(&mut table, "/bin/sched_last", &mut fa);

        assert_eq!(sched.advance(&mut table, &mut fa), Some(a));
        table.mark_dead(0, a).unwrap();

        // Sole process exited: nothing runnable, and the slot survives
        // because its kernel stack may still be in use.
        assert_eq!(sched.advance(&mut table, &mut fa), None);
        assert!(table.find(a).is_some());
    }

    #[test]
    fn reaping_returns_zombie_frames() {
        let mut fa = HostFrameAllocator::new();
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();

        let before_a = fa.outstanding();
        let a = spawn(&mut table, "/bin/sched_frames_a", &mut fa);
        // One root frame in the helper's throwaway kernel space, the rest
        // belongs to `a`.
        let a_frames = fa.outstanding() - before_a - 1;
        assert!(a_frames > 0);

        let b = spawn(&mut table, "/bin/sched_frames_b", &mut fa);
        let after_both = fa.outstanding();

        // Make `b` current, then let `a` die and get reaped.
        while sched.advance(&mut table, &mut fa) != Some(b) {}
        table.mark_dead(0, a).unwrap();
        sched.advance(&mut table, &mut fa);

        assert!(table.find(a).is_none());
        assert!(table.find(b).is_some());
        assert_eq!(fa.outstanding(), after_both - a_frames);
    }
}
