// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Encodes a [`CrashRecord`] into the dump container.
//!
//! Serialization is two-pass: the exact size of every stream is computed first, which picks
//! the richest truncation level that fits the size limit and fixes every directory offset, and
//! only then are bytes written, front to back, through a fixed buffer. Nothing allocates.

use crate::crash_info::{CaptureFlags, CrashRecord, RegisterSet, ThreadView};
use crate::dump::format::*;
use crate::shared::constants::DUMP_FORMAT_VERSION;
use nix::errno::Errno;
use serde::Serialize;
use std::io::{self, Write};
use std::os::fd::BorrowedFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SerializeError {
    #[error("writing the dump failed: {0}")]
    WriteFailed(Errno),
    #[error("short write: {written} of {expected} bytes reached the destination")]
    ShortWrite { expected: u64, written: u64 },
    #[error("the record needs {needed} bytes but dumps are limited to {max}")]
    RecordTooLarge { needed: usize, max: usize },
}

impl From<io::Error> for SerializeError {
    fn from(e: io::Error) -> Self {
        SerializeError::WriteFailed(Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
    }
}

/// How much of the record a dump carries, from everything down to the fault context alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TruncationLevel {
    Full,
    WithoutMemory,
    FaultingThreadOnly,
    WithoutModules,
    ContextOnly,
}

impl TruncationLevel {
    const LADDER: [TruncationLevel; 5] = [
        TruncationLevel::Full,
        TruncationLevel::WithoutMemory,
        TruncationLevel::FaultingThreadOnly,
        TruncationLevel::WithoutModules,
        TruncationLevel::ContextOnly,
    ];

    fn keeps_memory(self) -> bool {
        self == TruncationLevel::Full
    }

    fn keeps_all_threads(self) -> bool {
        self <= TruncationLevel::WithoutMemory
    }

    fn keeps_modules(self) -> bool {
        self <= TruncationLevel::FaultingThreadOnly
    }

    fn keeps_threads(self) -> bool {
        self <= TruncationLevel::WithoutModules
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamPlan {
    stream_type: StreamType,
    length: usize,
}

/// The exact layout of a dump, computed before anything is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpPlan {
    level: TruncationLevel,
    streams: [Option<StreamPlan>; 4],
    flags: CaptureFlags,
    total: usize,
}

impl DumpPlan {
    pub fn level(&self) -> TruncationLevel {
        self.level
    }

    pub fn total_size(&self) -> usize {
        self.total
    }

    /// Capture flags as they will be written, including what the truncation dropped.
    pub fn flags(&self) -> CaptureFlags {
        self.flags
    }

    pub fn stream_count(&self) -> usize {
        self.streams.iter().flatten().count()
    }

    fn for_level(record: &CrashRecord, level: TruncationLevel) -> Self {
        let mut flags = record.flags();
        let mut streams = [None; 4];
        let mut count = 0;
        let mut add = |stream_type, length| {
            streams[count] = Some(StreamPlan {
                stream_type,
                length,
            });
            count += 1;
        };

        add(StreamType::ExceptionContext, context_size(record));
        if level.keeps_threads() {
            add(StreamType::ThreadList, thread_list_size(record, level));
        } else if record.thread_count() > 0 {
            flags.insert(CaptureFlags::THREADS_DROPPED);
        }
        if !level.keeps_all_threads() && record.thread_count() > 1 {
            flags.insert(CaptureFlags::OTHER_THREADS_DROPPED);
        }
        if level.keeps_modules() {
            add(
                StreamType::ModuleList,
                4 + record.modules().iter().map(module_size).sum::<usize>(),
            );
        } else if !record.modules().is_empty() {
            flags.insert(CaptureFlags::MODULES_DROPPED);
        }
        if level.keeps_memory() {
            add(
                StreamType::MemoryRegion,
                4 + record.memory_regions().map(|r| region_size(&r)).sum::<usize>(),
            );
        } else if record.memory_regions().len() > 0 {
            flags.insert(CaptureFlags::MEMORY_DROPPED);
        }

        let payload: usize = streams.iter().flatten().map(|s| s.length).sum();
        let total = HEADER_SIZE + DIRECTORY_ENTRY_SIZE * count + payload + CHECKSUM_SIZE;
        Self {
            level,
            streams,
            flags,
            total,
        }
    }

    /// The richest layout of `record` that fits in `max_dump_bytes`.
    pub fn new(record: &CrashRecord, max_dump_bytes: usize) -> Result<Self, SerializeError> {
        Self::starting_at(record, max_dump_bytes, TruncationLevel::Full)
    }

    fn starting_at(
        record: &CrashRecord,
        max_dump_bytes: usize,
        first: TruncationLevel,
    ) -> Result<Self, SerializeError> {
        let limit = max_dump_bytes.min(u32::MAX as usize);
        let mut needed = 0;
        for level in TruncationLevel::LADDER.into_iter().filter(|l| *l >= first) {
            let plan = Self::for_level(record, level);
            if plan.total <= limit {
                return Ok(plan);
            }
            needed = plan.total;
        }
        Err(SerializeError::RecordTooLarge {
            needed,
            max: max_dump_bytes,
        })
    }
}

fn thread_list_size(record: &CrashRecord, level: TruncationLevel) -> usize {
    4 + threads_at(record, level).map(|t| thread_size(&t)).sum::<usize>()
}

fn threads_at(
    record: &CrashRecord,
    level: TruncationLevel,
) -> impl Iterator<Item = ThreadView<'_>> + '_ {
    let limit = if level.keeps_all_threads() {
        usize::MAX
    } else if record.faulting_thread().is_some() {
        1
    } else {
        0
    };
    record.threads().take(limit)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DumpStats {
    pub bytes_written: u64,
    pub level: TruncationLevel,
    pub stream_count: u32,
    #[serde(skip)]
    pub flags: CaptureFlags,
}

/// Tracks the running checksum and byte count of everything written.
struct DumpWriter<W> {
    inner: W,
    hasher: crc32fast::Hasher,
    written: u64,
}

impl<W: Write> DumpWriter<W> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), SerializeError> {
        let mut rest = bytes;
        while !rest.is_empty() {
            match self.inner.write(rest) {
                Ok(0) => return Err(self.short_write(rest.len())),
                Ok(n) => {
                    self.hasher.update(&rest[..n]);
                    self.written += n as u64;
                    rest = &rest[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WriteZero => {
                    return Err(self.short_write(rest.len()))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn short_write(&self, missing: usize) -> SerializeError {
        SerializeError::ShortWrite {
            expected: self.written + missing as u64,
            written: self.written,
        }
    }

    fn flush(&mut self) -> Result<(), SerializeError> {
        match self.inner.flush() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WriteZero => Err(self.short_write(0)),
            Err(e) => Err(e.into()),
        }
    }

    fn u32(&mut self, v: u32) -> Result<(), SerializeError> {
        self.put(&v.to_le_bytes())
    }

    fn i32(&mut self, v: i32) -> Result<(), SerializeError> {
        self.put(&v.to_le_bytes())
    }

    fn u64(&mut self, v: u64) -> Result<(), SerializeError> {
        self.put(&v.to_le_bytes())
    }

    fn registers(&mut self, registers: &RegisterSet) -> Result<(), SerializeError> {
        self.u32(registers.arch() as u32)?;
        self.u32(registers.values().len() as u32)?;
        for value in registers.values() {
            self.u64(*value)?;
        }
        Ok(())
    }
}

fn write_context<W: Write>(
    w: &mut DumpWriter<W>,
    record: &CrashRecord,
    flags: CaptureFlags,
) -> Result<(), SerializeError> {
    let context = record.context();
    w.i32(context.signal)?;
    w.i32(context.si_code)?;
    w.u32(context.pid)?;
    w.u32(context.tid)?;
    w.u64(context.fault_address)?;
    w.u64(context.instruction_pointer)?;
    w.u64(context.timestamp_ns)?;
    w.u32(flags.bits())?;
    w.u32(record.threads_seen())?;
    w.registers(&context.registers)
}

fn write_threads<W: Write>(
    w: &mut DumpWriter<W>,
    record: &CrashRecord,
    level: TruncationLevel,
) -> Result<(), SerializeError> {
    w.u32(threads_at(record, level).count() as u32)?;
    for thread in threads_at(record, level) {
        w.u32(thread.snapshot.tid)?;
        w.u32(thread.snapshot.flags.bits())?;
        w.registers(&thread.snapshot.registers)?;
        w.u32(thread.frames.len() as u32)?;
        for frame in thread.frames {
            w.u64(frame.return_address)?;
            w.u64(frame.frame_base.unwrap_or(0))?;
        }
    }
    Ok(())
}

fn write_modules<W: Write>(
    w: &mut DumpWriter<W>,
    record: &CrashRecord,
) -> Result<(), SerializeError> {
    w.u32(record.modules().len() as u32)?;
    for module in record.modules() {
        w.u64(module.base)?;
        w.u64(module.size)?;
        w.u32(module.build_id().len() as u32)?;
        w.put(module.build_id())?;
        w.u32(module.path().len() as u32)?;
        w.put(module.path())?;
    }
    Ok(())
}

fn write_memory<W: Write>(
    w: &mut DumpWriter<W>,
    record: &CrashRecord,
) -> Result<(), SerializeError> {
    w.u32(record.memory_regions().len() as u32)?;
    for region in record.memory_regions() {
        w.u64(region.start)?;
        w.u32(region.bytes.len() as u32)?;
        w.put(region.bytes)?;
    }
    Ok(())
}

fn write_planned<W: Write>(
    record: &CrashRecord,
    out: W,
    plan: &DumpPlan,
) -> Result<DumpStats, SerializeError> {
    let mut w = DumpWriter {
        inner: out,
        hasher: crc32fast::Hasher::new(),
        written: 0,
    };
    let streams = plan.streams.iter().flatten();
    let count = plan.stream_count();

    w.put(&MAGIC)?;
    w.u32(DUMP_FORMAT_VERSION)?;
    w.u32(count as u32)?;
    let mut offset = HEADER_SIZE + DIRECTORY_ENTRY_SIZE * count;
    for stream in streams.clone() {
        w.u32(stream.stream_type as u32)?;
        w.u32(offset as u32)?;
        w.u32(stream.length as u32)?;
        offset += stream.length;
    }
    for stream in streams {
        match stream.stream_type {
            StreamType::ExceptionContext => write_context(&mut w, record, plan.flags)?,
            StreamType::ThreadList => write_threads(&mut w, record, plan.level)?,
            StreamType::ModuleList => write_modules(&mut w, record)?,
            StreamType::MemoryRegion => write_memory(&mut w, record)?,
        }
    }
    let checksum = w.hasher.clone().finalize();
    w.u32(checksum)?;
    w.flush()?;

    if w.written != plan.total as u64 {
        return Err(SerializeError::ShortWrite {
            expected: plan.total as u64,
            written: w.written,
        });
    }
    Ok(DumpStats {
        bytes_written: w.written,
        level: plan.level,
        stream_count: count as u32,
        flags: plan.flags,
    })
}

/// Writes `record` to `out`, dropping content along the truncation ladder until it fits in
/// `max_dump_bytes`.
pub fn serialize_into<W: Write>(
    record: &CrashRecord,
    out: W,
    max_dump_bytes: usize,
) -> Result<DumpStats, SerializeError> {
    let plan = DumpPlan::new(record, max_dump_bytes)?;
    write_planned(record, out, &plan)
}

/// Writes the smallest useful dump of `record`: the fault context alone, flagged as a
/// fallback. Used after a full write has failed part way.
pub fn serialize_minimal_into<W: Write>(
    record: &CrashRecord,
    out: W,
    max_dump_bytes: usize,
) -> Result<DumpStats, SerializeError> {
    let mut plan = DumpPlan::starting_at(record, max_dump_bytes, TruncationLevel::ContextOnly)?;
    plan.flags.insert(CaptureFlags::MINIMAL_FALLBACK);
    write_planned(record, out, &plan)
}

/// Writes `record` to `fd` at its current offset. Async-signal-safe.
pub fn serialize(
    record: &CrashRecord,
    fd: BorrowedFd<'_>,
    max_dump_bytes: usize,
) -> Result<DumpStats, SerializeError> {
    serialize_into(record, FdWriter::new(fd), max_dump_bytes)
}

pub fn serialize_minimal(
    record: &CrashRecord,
    fd: BorrowedFd<'_>,
    max_dump_bytes: usize,
) -> Result<DumpStats, SerializeError> {
    serialize_minimal_into(record, FdWriter::new(fd), max_dump_bytes)
}

const FD_BUFFER: usize = 4096;

/// Buffered writes to a raw descriptor with `write(2)`, on a fixed inline buffer.
pub struct FdWriter<'fd> {
    fd: BorrowedFd<'fd>,
    buf: [u8; FD_BUFFER],
    len: usize,
}

impl<'fd> FdWriter<'fd> {
    pub fn new(fd: BorrowedFd<'fd>) -> Self {
        Self {
            fd,
            buf: [0; FD_BUFFER],
            len: 0,
        }
    }

    fn drain(&mut self) -> io::Result<()> {
        let mut done = 0;
        while done < self.len {
            match nix::unistd::write(self.fd, &self.buf[done..self.len]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => done += n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.len = 0;
                    return Err(e.into());
                }
            }
        }
        self.len = 0;
        Ok(())
    }
}

impl Write for FdWriter<'_> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if self.len == FD_BUFFER {
            self.drain()?;
        }
        let n = bytes.len().min(FD_BUFFER - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::reader::parse_dump;
    use crate::dump::test_utils::sample_record;

    #[test]
    fn test_full_dump_round_trips() {
        let record = sample_record();
        let mut out = Vec::new();
        let stats = serialize_into(&record, &mut out, 1 << 20).unwrap();
        assert_eq!(stats.level, TruncationLevel::Full);
        assert_eq!(stats.stream_count, 4);
        assert_eq!(stats.bytes_written as usize, out.len());
        assert_eq!(DumpPlan::new(&record, 1 << 20).unwrap().total_size(), out.len());

        let parsed = parse_dump(&out).unwrap();
        assert_eq!(parsed.context, *record.context());
        assert_eq!(parsed.threads.len(), 2);
        assert_eq!(parsed.threads[0].frames.len(), 3);
        assert_eq!(parsed.threads[0].frames[1].frame_base, Some(0x40_2000 + 0x7fb0_0000));
        assert_eq!(parsed.modules[0].path, "/bin/app");
        assert_eq!(parsed.modules[0].build_id, vec![0xab; 20]);
        assert_eq!(parsed.memory[0].bytes, vec![0x11; 64]);
        assert!(parsed.flags.is_empty());
    }

    #[test]
    fn test_walk_stopped_by_unreadable_record_survives_serialization() {
        use crate::collector::{SimulatedMemory, StopReason};
        use crate::crash_info::{Arch, CaptureLimits, FaultContext, RegisterSet, ThreadFlags};

        const STACK: u64 = 0x7000_0000;
        const CODE: u64 = 0x40_0000;
        // Two readable frame records; the second links to a record in unmapped memory.
        let (fp0, fp1, fp2) = (STACK + 0x100, STACK + 0x120, STACK + 0x10_0000);
        let mut memory = SimulatedMemory::new();
        memory.map_zeroed(STACK, 0x1000);
        assert!(memory.write_word(fp0, fp1));
        assert!(memory.write_word(fp0 + 8, CODE + 0x10));
        assert!(memory.write_word(fp1, fp2));
        assert!(memory.write_word(fp1 + 8, CODE + 0x20));
        let registers = RegisterSet::from_parts(Arch::X86_64, CODE, STACK + 0x80, fp0);

        let mut record = CrashRecord::with_limits(&CaptureLimits::default());
        record.set_context(FaultContext {
            signal: libc::SIGSEGV,
            tid: 7,
            instruction_pointer: CODE,
            registers,
            ..FaultContext::empty()
        });
        record.set_threads_seen(1);
        assert!(record.push_thread(7, registers, ThreadFlags::REGISTERS_VALID));
        let stop = record.record_stack(&registers, &memory, 64);
        assert_eq!(stop, StopReason::Unreadable);

        let mut out = Vec::new();
        let stats = serialize_into(&record, &mut out, 1 << 20).unwrap();
        assert_eq!(stats.level, TruncationLevel::Full);
        let parsed = parse_dump(&out).unwrap();
        assert!(parsed.flags.contains(CaptureFlags::WALK_TRUNCATED));
        assert!(!parsed.flags.contains(CaptureFlags::MINIMAL_FALLBACK));
        let thread = parsed.faulting_thread().unwrap();
        assert!(thread.flags.contains(ThreadFlags::WALK_TRUNCATED));
        assert!(thread.flags.contains(ThreadFlags::REGISTERS_VALID));
        let addresses: Vec<_> = thread.frames.iter().map(|f| f.return_address).collect();
        assert_eq!(addresses, vec![CODE, CODE + 0x10, CODE + 0x20]);
        assert_eq!(
            parsed.summary().flags,
            vec!["WALK_TRUNCATED"],
            "the summary names the truncation"
        );
    }

    #[test]
    fn test_truncation_ladder() {
        let record = sample_record();
        let sizes: Vec<usize> = TruncationLevel::LADDER
            .iter()
            .map(|level| DumpPlan::for_level(&record, *level).total_size())
            .collect();
        assert!(sizes.windows(2).all(|w| w[0] > w[1]), "{sizes:?}");

        // Just too small for the full record: the memory goes first.
        let mut out = Vec::new();
        let stats = serialize_into(&record, &mut out, sizes[0] - 1).unwrap();
        assert_eq!(stats.level, TruncationLevel::WithoutMemory);
        let parsed = parse_dump(&out).unwrap();
        assert!(parsed.flags.contains(CaptureFlags::MEMORY_DROPPED));
        assert!(parsed.memory.is_empty());
        assert_eq!(parsed.threads.len(), 2);

        let mut out = Vec::new();
        let stats = serialize_into(&record, &mut out, sizes[1] - 1).unwrap();
        assert_eq!(stats.level, TruncationLevel::FaultingThreadOnly);
        let parsed = parse_dump(&out).unwrap();
        assert_eq!(parsed.threads.len(), 1);
        assert_eq!(parsed.threads[0].tid, 101);
        assert!(parsed.flags.contains(CaptureFlags::OTHER_THREADS_DROPPED));

        let mut out = Vec::new();
        let stats = serialize_into(&record, &mut out, sizes[3] - 1).unwrap();
        assert_eq!(stats.level, TruncationLevel::ContextOnly);
        let parsed = parse_dump(&out).unwrap();
        assert!(parsed.threads.is_empty());
        assert!(parsed.modules.is_empty());
        assert!(parsed.flags.contains(CaptureFlags::THREADS_DROPPED));
        assert!(parsed.flags.contains(CaptureFlags::MODULES_DROPPED));
        assert_eq!(out.len(), sizes[4]);
    }

    #[test]
    fn test_record_too_large_writes_nothing() {
        let record = sample_record();
        let mut out = Vec::new();
        let err = serialize_into(&record, &mut out, 100).unwrap_err();
        assert!(matches!(err, SerializeError::RecordTooLarge { max: 100, .. }));
        assert!(out.is_empty());
    }

    #[test]
    fn test_minimal_dump_fits_minimal_size() {
        let record = sample_record();
        let mut out = Vec::new();
        let stats = serialize_minimal_into(&record, &mut out, minimal_dump_size()).unwrap();
        assert_eq!(stats.level, TruncationLevel::ContextOnly);
        assert!(out.len() <= minimal_dump_size());
        let parsed = parse_dump(&out).unwrap();
        assert!(parsed.flags.contains(CaptureFlags::MINIMAL_FALLBACK));
        assert_eq!(parsed.context.fault_address, 0xdead_beef);
    }

    struct FailAfter {
        remaining: usize,
    }

    impl Write for FailAfter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::from_raw_os_error(libc::ENOSPC));
            }
            let n = buf.len().min(self.remaining);
            self.remaining -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Closed;

    impl Write for Closed {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_errors() {
        let record = sample_record();
        assert_eq!(
            serialize_into(&record, FailAfter { remaining: 40 }, 1 << 20),
            Err(SerializeError::WriteFailed(Errno::ENOSPC))
        );
        assert!(matches!(
            serialize_into(&record, Closed, 1 << 20),
            Err(SerializeError::ShortWrite { written: 0, .. })
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_serialize_to_descriptor() {
        use std::io::{Read, Seek};
        use std::os::fd::AsFd;

        let record = sample_record();
        let mut file = tempfile::tempfile().unwrap();
        let stats = serialize(&record, file.as_fd(), 1 << 20).unwrap();
        file.rewind().unwrap();
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes.len() as u64, stats.bytes_written);
        assert_eq!(parse_dump(&bytes).unwrap().threads.len(), 2);
    }
}
