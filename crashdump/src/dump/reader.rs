// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Validation and decoding of dump files, for the process that picks them up after a crash.

use crate::crash_info::{
    si_code_name, Arch, CaptureFlags, FaultContext, Frame, HexBytes, RegisterSet, SignalNames,
    ThreadFlags, MAX_REGISTERS,
};
use crate::dump::format::*;
use crate::shared::constants::DUMP_FORMAT_VERSION;
use anyhow::Context;
use num_traits::FromPrimitive;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("dump is only {len} bytes long")]
    TooShort { len: usize },
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported dump format version {0}")]
    UnsupportedVersion(u32),
    #[error("stream directory runs past the end of the dump")]
    DirectoryOutOfBounds,
    #[error("stream {index} ({offset}+{length}) lies outside the stream area")]
    StreamOutOfBounds {
        index: usize,
        offset: u32,
        length: u32,
    },
    #[error("streams {first} and {second} overlap")]
    OverlappingStreams { first: usize, second: usize },
    #[error("stream type {0:?} appears more than once")]
    DuplicateStream(StreamType),
    #[error("dump has no exception context stream")]
    MissingContext,
    #[error("dump is {actual} bytes but its streams end at {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("malformed {stream:?} stream: {reason}")]
    Malformed {
        stream: StreamType,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEntry {
    pub stream_type: StreamType,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedThread {
    pub tid: u32,
    pub flags: ThreadFlags,
    pub registers: RegisterSet,
    pub frames: Vec<Frame>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModule {
    pub base: u64,
    pub size: u64,
    pub build_id: Vec<u8>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRegion {
    pub start: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDump {
    pub format_version: u32,
    pub streams: Vec<StreamEntry>,
    pub context: FaultContext,
    pub flags: CaptureFlags,
    pub threads_seen: u32,
    pub threads: Vec<ParsedThread>,
    pub modules: Vec<ParsedModule>,
    pub memory: Vec<ParsedRegion>,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    stream: StreamType,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.bytes.len() < n {
            return Err(ParseError::Malformed {
                stream: self.stream,
                reason: "unexpected end of stream",
            });
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, ParseError> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64, ParseError> {
        let b = self.take(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(b);
        Ok(u64::from_le_bytes(word))
    }

    fn malformed(&self, reason: &'static str) -> ParseError {
        ParseError::Malformed {
            stream: self.stream,
            reason,
        }
    }

    /// A count that must be backed by at least `min_item` bytes per item.
    fn count(&mut self, min_item: usize) -> Result<usize, ParseError> {
        let count = self.u32()? as usize;
        if count.saturating_mul(min_item) > self.bytes.len() {
            return Err(self.malformed("count exceeds stream length"));
        }
        Ok(count)
    }

    fn registers(&mut self) -> Result<RegisterSet, ParseError> {
        let arch = self.u32()?;
        let count = self.u32()? as usize;
        if count > MAX_REGISTERS {
            return Err(self.malformed("too many registers"));
        }
        let arch = Arch::from_u32(arch).ok_or_else(|| self.malformed("unknown architecture"))?;
        let mut values = [0u64; MAX_REGISTERS];
        for value in values.iter_mut().take(count) {
            *value = self.u64()?;
        }
        Ok(RegisterSet::new(arch, &values[..count]))
    }

    fn finish(&self) -> Result<(), ParseError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(self.malformed("trailing bytes"))
        }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Validates the container and decodes every stream.
pub fn parse_dump(bytes: &[u8]) -> Result<ParsedDump, ParseError> {
    if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return Err(ParseError::TooShort { len: bytes.len() });
    }
    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if magic != MAGIC {
        return Err(ParseError::BadMagic(magic));
    }
    let format_version = read_u32(bytes, 4);
    if format_version == 0 || format_version > DUMP_FORMAT_VERSION {
        return Err(ParseError::UnsupportedVersion(format_version));
    }
    let stream_count = read_u32(bytes, 8) as usize;
    let body_end = bytes.len() - CHECKSUM_SIZE;
    let directory_end = stream_count
        .checked_mul(DIRECTORY_ENTRY_SIZE)
        .and_then(|n| n.checked_add(HEADER_SIZE))
        .filter(|end| *end <= body_end)
        .ok_or(ParseError::DirectoryOutOfBounds)?;

    // Unknown tags come from newer writers; they are skipped but still count for layout checks.
    let mut layout: Vec<(usize, usize, usize)> = Vec::with_capacity(stream_count);
    let mut known: Vec<StreamEntry> = Vec::with_capacity(stream_count);
    for index in 0..stream_count {
        let at = HEADER_SIZE + index * DIRECTORY_ENTRY_SIZE;
        let (tag, offset, length) = (
            read_u32(bytes, at),
            read_u32(bytes, at + 4),
            read_u32(bytes, at + 8),
        );
        let end = offset as usize + length as usize;
        if (offset as usize) < directory_end || end > body_end {
            return Err(ParseError::StreamOutOfBounds {
                index,
                offset,
                length,
            });
        }
        layout.push((offset as usize, end, index));
        if let Some(stream_type) = StreamType::from_u32(tag) {
            if known.iter().any(|s| s.stream_type == stream_type) {
                return Err(ParseError::DuplicateStream(stream_type));
            }
            known.push(StreamEntry {
                stream_type,
                offset,
                length,
            });
        }
    }

    layout.sort_unstable();
    for pair in layout.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(ParseError::OverlappingStreams {
                first: pair[0].2,
                second: pair[1].2,
            });
        }
    }
    let streams_end = layout.last().map_or(directory_end, |l| l.1);
    if streams_end != body_end {
        return Err(ParseError::LengthMismatch {
            expected: streams_end + CHECKSUM_SIZE,
            actual: bytes.len(),
        });
    }

    let stored = read_u32(bytes, body_end);
    let computed = crc32fast::hash(&bytes[..body_end]);
    if stored != computed {
        return Err(ParseError::ChecksumMismatch { stored, computed });
    }

    let payload = |stream_type: StreamType| {
        known
            .iter()
            .find(|s| s.stream_type == stream_type)
            .map(|s| Cursor {
                bytes: &bytes[s.offset as usize..s.offset as usize + s.length as usize],
                stream: stream_type,
            })
    };

    let mut context_cursor =
        payload(StreamType::ExceptionContext).ok_or(ParseError::MissingContext)?;
    let (context, flags, threads_seen) = parse_context(&mut context_cursor)?;
    let threads = payload(StreamType::ThreadList)
        .map(|mut c| parse_threads(&mut c))
        .transpose()?
        .unwrap_or_default();
    let modules = payload(StreamType::ModuleList)
        .map(|mut c| parse_modules(&mut c))
        .transpose()?
        .unwrap_or_default();
    let memory = payload(StreamType::MemoryRegion)
        .map(|mut c| parse_memory(&mut c))
        .transpose()?
        .unwrap_or_default();

    Ok(ParsedDump {
        format_version,
        streams: known,
        context,
        flags,
        threads_seen,
        threads,
        modules,
        memory,
    })
}

fn parse_context(c: &mut Cursor) -> Result<(FaultContext, CaptureFlags, u32), ParseError> {
    let signal = c.i32()?;
    let si_code = c.i32()?;
    let pid = c.u32()?;
    let tid = c.u32()?;
    let fault_address = c.u64()?;
    let instruction_pointer = c.u64()?;
    let timestamp_ns = c.u64()?;
    let flags = CaptureFlags::from_bits_retain(c.u32()?);
    let threads_seen = c.u32()?;
    let registers = c.registers()?;
    c.finish()?;
    Ok((
        FaultContext {
            signal,
            si_code,
            pid,
            tid,
            fault_address,
            instruction_pointer,
            timestamp_ns,
            registers,
        },
        flags,
        threads_seen,
    ))
}

fn parse_threads(c: &mut Cursor) -> Result<Vec<ParsedThread>, ParseError> {
    let count = c.count(20)?;
    let mut threads = Vec::with_capacity(count);
    for _ in 0..count {
        let tid = c.u32()?;
        let flags = ThreadFlags::from_bits_retain(c.u32()?);
        let registers = c.registers()?;
        let frame_count = c.count(16)?;
        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            let return_address = c.u64()?;
            let frame_base = c.u64()?;
            frames.push(Frame {
                return_address,
                frame_base: (frame_base != 0).then_some(frame_base),
            });
        }
        threads.push(ParsedThread {
            tid,
            flags,
            registers,
            frames,
        });
    }
    c.finish()?;
    Ok(threads)
}

fn parse_modules(c: &mut Cursor) -> Result<Vec<ParsedModule>, ParseError> {
    let count = c.count(24)?;
    let mut modules = Vec::with_capacity(count);
    for _ in 0..count {
        let base = c.u64()?;
        let size = c.u64()?;
        let build_id_len = c.u32()? as usize;
        let build_id = c.take(build_id_len)?.to_vec();
        let path_len = c.u32()? as usize;
        let path = String::from_utf8_lossy(c.take(path_len)?).into_owned();
        modules.push(ParsedModule {
            base,
            size,
            build_id,
            path,
        });
    }
    c.finish()?;
    Ok(modules)
}

fn parse_memory(c: &mut Cursor) -> Result<Vec<ParsedRegion>, ParseError> {
    let count = c.count(12)?;
    let mut regions = Vec::with_capacity(count);
    for _ in 0..count {
        let start = c.u64()?;
        let len = c.u32()? as usize;
        regions.push(ParsedRegion {
            start,
            bytes: c.take(len)?.to_vec(),
        });
    }
    c.finish()?;
    Ok(regions)
}

/// Reads and parses a dump file. I/O errors and parse errors both surface through `anyhow`.
pub fn read_dump_file(path: impl AsRef<Path>) -> anyhow::Result<ParsedDump> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    parse_dump(&bytes).with_context(|| format!("Invalid dump {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub tid: u32,
    pub frames: usize,
    pub flags: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    pub path: String,
    pub base: String,
    pub build_id: String,
}

/// A JSON friendly digest of a dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub format_version: u32,
    pub signal: i32,
    pub signal_name: SignalNames,
    pub si_code: &'static str,
    pub pid: u32,
    pub faulting_tid: u32,
    pub fault_address: String,
    pub instruction_pointer: String,
    pub timestamp_ns: u64,
    pub flags: Vec<&'static str>,
    pub threads_seen: u32,
    pub threads: Vec<ThreadSummary>,
    pub faulting_stack: Vec<String>,
    pub modules: Vec<ModuleSummary>,
    pub memory_regions: usize,
}

impl ParsedDump {
    pub fn has_stream(&self, stream_type: StreamType) -> bool {
        self.streams.iter().any(|s| s.stream_type == stream_type)
    }

    pub fn faulting_thread(&self) -> Option<&ParsedThread> {
        self.threads.first().filter(|t| t.tid == self.context.tid)
    }

    pub fn summary(&self) -> DumpSummary {
        DumpSummary {
            file: None,
            format_version: self.format_version,
            signal: self.context.signal,
            signal_name: SignalNames::from(self.context.signal),
            si_code: si_code_name(self.context.signal, self.context.si_code),
            pid: self.context.pid,
            faulting_tid: self.context.tid,
            fault_address: format!("{:#x}", self.context.fault_address),
            instruction_pointer: format!("{:#x}", self.context.instruction_pointer),
            timestamp_ns: self.context.timestamp_ns,
            flags: self.flags.iter_names().map(|(name, _)| name).collect(),
            threads_seen: self.threads_seen,
            threads: self
                .threads
                .iter()
                .map(|t| ThreadSummary {
                    tid: t.tid,
                    frames: t.frames.len(),
                    flags: t.flags.iter_names().map(|(name, _)| name).collect(),
                })
                .collect(),
            faulting_stack: self
                .faulting_thread()
                .map(|t| {
                    t.frames
                        .iter()
                        .map(|f| format!("{:#x}", f.return_address))
                        .collect()
                })
                .unwrap_or_default(),
            modules: self
                .modules
                .iter()
                .map(|m| ModuleSummary {
                    path: m.path.clone(),
                    base: format!("{:#x}", m.base),
                    build_id: HexBytes(&m.build_id).to_string(),
                })
                .collect(),
            memory_regions: self.memory.len(),
        }
    }
}
