//! Narrow seam to the filesystem layer. The real VFS is out of scope for
//! this kernel core; the process/loader/syscall paths only ever need
//! "look up a path" and "read N bytes at an offset", so that is all this
//! module offers. Images are registered at boot from multiboot modules.

use alloc::string::String;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::KernelError;
use crate::process::ProcessId;

struct OpenFile {
    pid: ProcessId,
    fd: usize,
    path: String,
    offset: usize,
}

pub struct Vfs {
    images: Vec<(String, &'static [u8])>,
    open_files: Vec<OpenFile>,
}

lazy_static! {
    pub static ref VFS: Mutex<Vfs> = Mutex::new(Vfs::new());
}

impl Vfs {
    pub fn new() -> Self {
        Vfs {
            images: Vec::new(),
            open_files: Vec::new(),
        }
    }

    /// Register a file image under `path`. Later registrations shadow
    /// earlier ones.
    pub fn register(&mut self, path: &str, bytes: &'static [u8]) {
        self.images.retain(|(p, _)| p != path);
        self.images.push((String::from(path), bytes));
    }

    pub fn lookup(&self, path: &str) -> Result<&'static [u8], KernelError> {
        self.images
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, bytes)| *bytes)
            .ok_or(KernelError::NotFound)
    }

    /// Bind an already-allocated process fd slot to `path`.
    pub fn open(&mut self, pid: ProcessId, fd: usize, path: &str) -> Result<(), KernelError> {
        self.lookup(path)?;
        self.open_files.push(OpenFile {
            pid,
            fd,
            path: String::from(path),
            offset: 0,
        });
        Ok(())
    }

    /// Sequential read; advances the per-open-file cursor. Returns the
    /// number of bytes copied, 0 at end of file.
    pub fn read_fd(
        &mut self,
        pid: ProcessId,
        fd: usize,
        buf: &mut [u8],
    ) -> Result<usize, KernelError> {
        let (path, offset) = {
            let file = self
                .open_files
                .iter()
                .find(|f| f.pid == pid && f.fd == fd)
                .ok_or(KernelError::InvalidArgument)?;
            (file.path.clone(), file.offset)
        };
        let bytes = self.lookup(&path)?;
        let remaining = bytes.len().saturating_sub(offset);
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        let file = self
            .open_files
            .iter_mut()
            .find(|f| f.pid == pid && f.fd == fd)
            .ok_or(KernelError::InvalidArgument)?;
        file.offset += n;
        Ok(n)
    }

    pub fn close(&mut self, pid: ProcessId, fd: usize) {
        self.open_files.retain(|f| !(f.pid == pid && f.fd == fd));
    }

    /// Drop every open file a process still holds; called on reap.
    pub fn close_all(&mut self, pid: ProcessId) {
        self.open_files.retain(|f| f.pid != pid);
    }
}
