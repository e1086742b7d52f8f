// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Where dumps go, opened at install time so a capture never resolves a path.
//!
//! A directory destination writes `<uuid>-<seq>.dmp.tmp` relative to the pre-opened directory
//! and renames it to `<uuid>-<seq>.dmp` once the checksum is on disk, so consumers only ever
//! see complete files. A descriptor destination writes at the descriptor's current offset.

use crate::crash_info::{CaptureFlags, CrashRecord};
use crate::dump::writer::{serialize, serialize_minimal, DumpStats, SerializeError};
use crate::shared::configuration::Destination;
use crate::shared::constants::{DUMP_SUFFIX, PARTIAL_DUMP_SUFFIX};
use crashdump_common::unix_utils::{write_decimal, write_stderr};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use std::ffi::CStr;
use std::fmt;
use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

const BASE_NAME_LEN: usize = uuid::fmt::Hyphenated::LENGTH;
/// `<uuid>-<seq>.dmp.tmp` plus a terminating NUL.
pub const MAX_FILE_NAME_LEN: usize = 64;

/// What happened to one capture, handed to the dump-written callback.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DumpOutcome {
    pub succeeded: bool,
    /// The full write failed and the fault context alone was written instead.
    pub minimal: bool,
    pub signal: i32,
    pub faulting_tid: u32,
    pub bytes_written: u64,
    pub flags: CaptureFlags,
    file_name: [u8; MAX_FILE_NAME_LEN],
    file_name_len: u8,
}

impl DumpOutcome {
    fn new(record: &CrashRecord) -> Self {
        Self {
            succeeded: false,
            minimal: false,
            signal: record.context().signal,
            faulting_tid: record.context().tid,
            bytes_written: 0,
            flags: record.flags(),
            file_name: [0; MAX_FILE_NAME_LEN],
            file_name_len: 0,
        }
    }

    fn written(&mut self, stats: &DumpStats, minimal: bool) {
        self.succeeded = true;
        self.minimal = minimal;
        self.bytes_written = stats.bytes_written;
        self.flags = stats.flags;
    }

    /// Name of the published file, relative to the dump directory.
    pub fn file_name(&self) -> Option<&str> {
        if self.file_name_len == 0 {
            return None;
        }
        std::str::from_utf8(&self.file_name[..self.file_name_len as usize]).ok()
    }
}

impl fmt::Debug for DumpOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumpOutcome")
            .field("succeeded", &self.succeeded)
            .field("minimal", &self.minimal)
            .field("signal", &self.signal)
            .field("faulting_tid", &self.faulting_tid)
            .field("bytes_written", &self.bytes_written)
            .field("flags", &self.flags)
            .field("file_name", &self.file_name())
            .finish()
    }
}

enum Target {
    Directory {
        dir: OwnedFd,
        base_name: [u8; BASE_NAME_LEN],
        seq: u32,
    },
    Descriptor(RawFd),
}

/// An opened destination. Writing through it is async-signal-safe.
pub struct DumpTarget {
    target: Target,
    max_dump_bytes: usize,
}

impl DumpTarget {
    pub fn open(destination: &Destination, max_dump_bytes: usize) -> std::io::Result<Self> {
        let target = match destination {
            Destination::Directory(path) => {
                std::fs::create_dir_all(path)?;
                let dir = OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
                    .open(path)?;
                let mut base_name = [0u8; BASE_NAME_LEN];
                uuid::Uuid::new_v4()
                    .hyphenated()
                    .encode_lower(&mut base_name);
                Target::Directory {
                    dir: OwnedFd::from(dir),
                    base_name,
                    seq: 0,
                }
            }
            Destination::Descriptor(fd) => {
                fcntl(*fd, FcntlArg::F_GETFD)?;
                Target::Descriptor(*fd)
            }
        };
        Ok(Self {
            target,
            max_dump_bytes,
        })
    }

    pub fn max_dump_bytes(&self) -> usize {
        self.max_dump_bytes
    }

    /// Base name shared by every file this target publishes.
    pub fn base_name(&self) -> Option<&str> {
        match &self.target {
            Target::Directory { base_name, .. } => std::str::from_utf8(base_name).ok(),
            Target::Descriptor(_) => None,
        }
    }

    /// Writes `record` out. Failures are reported through the outcome, never retried.
    pub fn write(&mut self, record: &CrashRecord) -> DumpOutcome {
        let max = self.max_dump_bytes;
        let mut outcome = DumpOutcome::new(record);
        match &mut self.target {
            Target::Directory {
                dir,
                base_name,
                seq,
            } => {
                *seq = seq.wrapping_add(1);
                write_to_directory(dir.as_fd(), base_name, *seq, record, max, &mut outcome);
            }
            Target::Descriptor(fd) => {
                // Safety: the descriptor belongs to the caller, who keeps it open while installed.
                let fd = unsafe { BorrowedFd::borrow_raw(*fd) };
                write_to_descriptor(fd, record, max, &mut outcome);
            }
        }
        outcome
    }
}

/// `<base>-<seq>` followed by `suffix` and a NUL. Returns the length without the NUL.
fn file_name(base: &[u8], seq: u32, suffix: &[u8], out: &mut [u8; MAX_FILE_NAME_LEN]) -> usize {
    let mut len = base.len();
    out[..len].copy_from_slice(base);
    out[len] = b'-';
    len += 1;
    // A u32 never needs more than 10 digits, and the buffer has room for them.
    len += write_decimal(&mut out[len..], seq as u64).unwrap_or(0);
    out[len..len + suffix.len()].copy_from_slice(suffix);
    len += suffix.len();
    out[len] = 0;
    len
}

fn c_name(buf: &[u8; MAX_FILE_NAME_LEN], len: usize) -> Option<&CStr> {
    CStr::from_bytes_with_nul(&buf[..=len]).ok()
}

fn write_to_directory(
    dir: BorrowedFd<'_>,
    base_name: &[u8],
    seq: u32,
    record: &CrashRecord,
    max: usize,
    outcome: &mut DumpOutcome,
) {
    let mut partial = [0u8; MAX_FILE_NAME_LEN];
    let partial_len = file_name(base_name, seq, PARTIAL_DUMP_SUFFIX.as_bytes(), &mut partial);
    let mut complete = [0u8; MAX_FILE_NAME_LEN];
    let complete_len = file_name(base_name, seq, DUMP_SUFFIX.as_bytes(), &mut complete);
    let (Some(partial_c), Some(complete_c)) = (
        c_name(&partial, partial_len),
        c_name(&complete, complete_len),
    ) else {
        return;
    };

    // Safety: `partial_c` is NUL terminated and `dir` is an open directory.
    let raw = unsafe {
        libc::openat(
            dir.as_raw_fd(),
            partial_c.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
            0o600 as libc::c_uint,
        )
    };
    if raw < 0 {
        write_stderr(b"crashdump: cannot create dump file\n");
        return;
    }
    // Safety: `raw` was just opened and nothing else owns it.
    let file = unsafe { OwnedFd::from_raw_fd(raw) };

    let written = match serialize(record, file.as_fd(), max) {
        Ok(stats) => Some((stats, false)),
        Err(SerializeError::RecordTooLarge { .. }) => None,
        Err(_) => {
            // Safety: plain syscalls on a descriptor we own.
            unsafe {
                libc::ftruncate(raw, 0);
                libc::lseek(raw, 0, libc::SEEK_SET);
            }
            serialize_minimal(record, file.as_fd(), max)
                .ok()
                .map(|stats| (stats, true))
        }
    };
    // Safety: plain syscalls on descriptors we own, with NUL terminated names.
    let published = written.is_some()
        && unsafe { libc::fsync(raw) } == 0
        && unsafe {
            libc::renameat(
                dir.as_raw_fd(),
                partial_c.as_ptr(),
                dir.as_raw_fd(),
                complete_c.as_ptr(),
            )
        } == 0;
    drop(file);

    match written {
        Some((stats, minimal)) if published => {
            // Safety: `dir` is open. A failure here only weakens durability of the rename.
            unsafe { libc::fsync(dir.as_raw_fd()) };
            outcome.written(&stats, minimal);
            outcome.file_name[..complete_len].copy_from_slice(&complete[..complete_len]);
            outcome.file_name_len = complete_len as u8;
        }
        _ => {
            // Safety: `dir` is open and the name is NUL terminated.
            unsafe { libc::unlinkat(dir.as_raw_fd(), partial_c.as_ptr(), 0) };
            write_stderr(b"crashdump: dump write failed\n");
        }
    }
}

fn write_to_descriptor(
    fd: BorrowedFd<'_>,
    record: &CrashRecord,
    max: usize,
    outcome: &mut DumpOutcome,
) {
    let raw = fd.as_raw_fd();
    // Safety: lseek has no memory preconditions. Pipes and sockets report ESPIPE.
    let start = unsafe { libc::lseek(raw, 0, libc::SEEK_CUR) };
    let written = match serialize(record, fd, max) {
        Ok(stats) => Some((stats, false)),
        Err(SerializeError::RecordTooLarge { .. }) => None,
        Err(_) if start >= 0 => {
            // Safety: as above.
            unsafe {
                libc::lseek(raw, start, libc::SEEK_SET);
                libc::ftruncate(raw, start);
            }
            serialize_minimal(record, fd, max)
                .ok()
                .map(|stats| (stats, true))
        }
        Err(_) => None,
    };
    match written {
        Some((stats, minimal)) => {
            // Safety: fsync has no memory preconditions. It fails harmlessly on pipes.
            let _ = Errno::result(unsafe { libc::fsync(raw) });
            outcome.written(&stats, minimal);
        }
        None => write_stderr(b"crashdump: dump write failed\n"),
    }
}
