// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault-tolerant reads of process memory.
//!
//! A crashing process cannot trust its own address space: the pointers the stack walker
//! follows may be garbage. Every read of memory that was not produced by this crate goes
//! through a [`MemoryReader`], which reports unreadable memory as an error instead of faulting.

use crate::collector::platform::WORD_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("address {addr:#x} is not readable")]
    Unmapped { addr: u64 },
    #[error("memory reads are not supported here")]
    Unsupported,
}

pub trait MemoryReader {
    /// Fills `buf` with the bytes at `addr`, or fails without touching the caller's memory
    /// state. Must be async-signal-safe.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadError>;

    fn read_word(&self, addr: u64) -> Result<u64, ReadError> {
        let mut bytes = [0u8; WORD_SIZE as usize];
        self.read(addr, &mut bytes)?;
        Ok(u64::from_ne_bytes(bytes))
    }

    fn read_u32(&self, addr: u64) -> Result<u32, ReadError> {
        let mut bytes = [0u8; 4];
        self.read(addr, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_u16(&self, addr: u64) -> Result<u16, ReadError> {
        let mut bytes = [0u8; 2];
        self.read(addr, &mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    /// Reads as many leading bytes of `buf` as are readable, a page at a time, and returns how
    /// many that was.
    fn read_prefix(&self, addr: u64, buf: &mut [u8]) -> usize {
        const PAGE: u64 = 4096;
        let mut done = 0usize;
        while done < buf.len() {
            let at = addr.wrapping_add(done as u64);
            let to_page_end = (PAGE - at % PAGE) as usize;
            let chunk = to_page_end.min(buf.len() - done);
            if self.read(at, &mut buf[done..done + chunk]).is_err() {
                break;
            }
            done += chunk;
        }
        done
    }
}

impl<R: MemoryReader + ?Sized> MemoryReader for &R {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        (**self).read(addr, buf)
    }
}

/// Memory assembled from byte segments at chosen addresses. Anything outside the segments is
/// unreadable. Used to replay captures and to exercise the walker on hand-built stacks.
#[derive(Debug, Clone, Default)]
pub struct SimulatedMemory {
    segments: Vec<(u64, Vec<u8>)>,
}

impl SimulatedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `bytes` at `base`. Later segments shadow earlier ones where they overlap.
    pub fn map(&mut self, base: u64, bytes: Vec<u8>) -> &mut Self {
        self.segments.push((base, bytes));
        self
    }

    /// Maps `len` zero bytes at `base`.
    pub fn map_zeroed(&mut self, base: u64, len: usize) -> &mut Self {
        self.map(base, vec![0; len])
    }

    /// Stores a native-endian word into an already mapped segment. Returns false if `addr`
    /// is not mapped.
    pub fn write_word(&mut self, addr: u64, value: u64) -> bool {
        let bytes = value.to_ne_bytes();
        for (base, segment) in self.segments.iter_mut().rev() {
            let Some(offset) = addr.checked_sub(*base) else {
                continue;
            };
            let offset = offset as usize;
            if offset + bytes.len() <= segment.len() {
                segment[offset..offset + bytes.len()].copy_from_slice(&bytes);
                return true;
            }
        }
        false
    }
}

impl MemoryReader for SimulatedMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        let end = addr
            .checked_add(buf.len() as u64)
            .ok_or(ReadError::Unmapped { addr })?;
        for (base, segment) in self.segments.iter().rev() {
            let seg_end = base + segment.len() as u64;
            if addr >= *base && end <= seg_end {
                let offset = (addr - base) as usize;
                buf.copy_from_slice(&segment[offset..offset + buf.len()]);
                return Ok(());
            }
        }
        Err(ReadError::Unmapped { addr })
    }
}

#[cfg(target_os = "linux")]
pub use linux::ProcessMemoryReader;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::uio::{process_vm_readv, RemoteIoVec};
    use nix::unistd::Pid;
    use std::io::IoSliceMut;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Reads the current process's memory with `process_vm_readv(2)`, which reports `EFAULT`
    /// for unmapped addresses instead of raising `SIGSEGV`.
    ///
    /// Where that syscall is not permitted (seccomp, old kernels) it falls back to writing the
    /// memory into a private pipe: `write(2)` also fails with `EFAULT` on a bad source buffer.
    pub struct ProcessMemoryReader {
        probe_read: OwnedFd,
        probe_write: OwnedFd,
        vm_readv_unavailable: AtomicBool,
    }

    impl ProcessMemoryReader {
        pub fn new() -> nix::Result<Self> {
            let (probe_read, probe_write) =
                nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC | nix::fcntl::OFlag::O_NONBLOCK)?;
            Ok(Self {
                probe_read,
                probe_write,
                vm_readv_unavailable: AtomicBool::new(false),
            })
        }

        fn read_vm(&self, addr: u64, buf: &mut [u8]) -> Result<(), Errno> {
            let len = buf.len();
            let remote = [RemoteIoVec {
                base: addr as usize,
                len,
            }];
            // Looked up on every read so a forked child reads its own memory.
            let pid = Pid::this();
            loop {
                let mut local = [IoSliceMut::new(buf)];
                match process_vm_readv(pid, &mut local, &remote) {
                    Ok(n) if n == len => return Ok(()),
                    // A short read means the range runs into unmapped memory.
                    Ok(_) => return Err(Errno::EFAULT),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        fn read_via_pipe(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadError> {
            // Pipes hold at least one page without blocking.
            const CHUNK: usize = 4096;
            let mut done = 0;
            while done < buf.len() {
                let want = CHUNK.min(buf.len() - done);
                let src = addr.wrapping_add(done as u64) as usize as *const libc::c_void;
                // Safety: write(2) validates the source range itself and fails with EFAULT.
                let written =
                    unsafe { libc::write(self.probe_write.as_raw_fd(), src, want) };
                if written <= 0 {
                    if written < 0 && Errno::last() == Errno::EINTR {
                        continue;
                    }
                    return Err(ReadError::Unmapped {
                        addr: addr.wrapping_add(done as u64),
                    });
                }
                let mut drained = 0;
                while drained < written as usize {
                    let dst = &mut buf[done + drained..done + written as usize];
                    // Safety: `dst` is a live, writable slice.
                    let n = unsafe {
                        libc::read(self.probe_read.as_raw_fd(), dst.as_mut_ptr().cast(), dst.len())
                    };
                    if n <= 0 {
                        if n < 0 && Errno::last() == Errno::EINTR {
                            continue;
                        }
                        return Err(ReadError::Unsupported);
                    }
                    drained += n as usize;
                }
                done += written as usize;
            }
            Ok(())
        }
    }

    impl MemoryReader for ProcessMemoryReader {
        fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadError> {
            if buf.is_empty() {
                return Ok(());
            }
            if addr == 0 || addr.checked_add(buf.len() as u64).is_none() {
                return Err(ReadError::Unmapped { addr });
            }
            if !self.vm_readv_unavailable.load(Ordering::Relaxed) {
                match self.read_vm(addr, buf) {
                    Ok(()) => return Ok(()),
                    Err(Errno::EFAULT) | Err(Errno::ESRCH) => {
                        return Err(ReadError::Unmapped { addr })
                    }
                    Err(_) => self.vm_readv_unavailable.store(true, Ordering::Relaxed),
                }
            }
            self.read_via_pipe(addr, buf)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_memory() {
        let mut memory = SimulatedMemory::new();
        memory.map_zeroed(0x1000, 64).map(0x2000, vec![1, 2, 3, 4]);
        assert!(memory.write_word(0x1008, 0xdead_beef));
        assert!(!memory.write_word(0x3000, 1));

        assert_eq!(memory.read_word(0x1008), Ok(0xdead_beef));
        assert_eq!(memory.read_u32(0x2000), Ok(0x0403_0201));
        assert_eq!(memory.read_u16(0x2002), Ok(0x0403));
        assert_eq!(
            memory.read_word(0x103c),
            Err(ReadError::Unmapped { addr: 0x103c })
        );
        assert_eq!(
            memory.read_word(0x0),
            Err(ReadError::Unmapped { addr: 0x0 })
        );
    }

    #[test]
    fn test_read_prefix() {
        let mut memory = SimulatedMemory::new();
        memory.map(0x1000, vec![7; 4096]);
        let mut buf = [0u8; 6000];
        assert_eq!(memory.read_prefix(0x1000, &mut buf), 4096);
        assert_eq!(memory.read_prefix(0x5000, &mut buf), 0);
    }
}
