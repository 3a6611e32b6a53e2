use core::fmt;

/// Kernel-wide error taxonomy. Anything attributable to a single call is
/// reported through this enum; kernel-internal inconsistencies panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Frame, page or table allocation failed.
    NoMemory,
    /// Misaligned address, unmapped page, malformed argument, self-kill.
    InvalidArgument,
    /// Process table / PID space exhausted.
    NoSpace,
    /// `allocate_at` hit a frame that is already handed out.
    AlreadyAllocated,
    /// Path does not resolve to a registered file.
    NotFound,
    /// ELF image failed validation.
    BadExecutable,
    /// Per-process file descriptor table is full.
    Exhausted,
}

impl KernelError {
    /// Negative C-style errno, used at the syscall ABI boundary.
    pub fn errno(self) -> i64 {
        match self {
            KernelError::NoMemory => -12,         // ENOMEM
            KernelError::InvalidArgument => -22,  // EINVAL
            KernelError::NoSpace => -28,          // ENOSPC
            KernelError::AlreadyAllocated => -16, // EBUSY
            KernelError::NotFound => -2,          // ENOENT
            KernelError::BadExecutable => -22,    // EINVAL, bad ELF is a bad argument
            KernelError::Exhausted => -24,        // EMFILE
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::NoMemory => write!(f, "Out of physical memory"),
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::NoSpace => write!(f, "Process table full"),
            KernelError::AlreadyAllocated => write!(f, "Frame already allocated"),
            KernelError::NotFound => write!(f, "File not found"),
            KernelError::BadExecutable => write!(f, "Invalid executable image"),
            KernelError::Exhausted => write!(f, "File descriptor table full"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_c_codes() {
        assert_eq!(KernelError::NoMemory.errno(), -12);
        assert_eq!(KernelError::InvalidArgument.errno(), -22);
        assert_eq!(KernelError::NoSpace.errno(), -28);
        assert_eq!(KernelError::BadExecutable.errno(), -22);
    }
}
