// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Layout of the dump container.
//!
//! ```text
//! header     magic "CDMP" | format_version u32 | stream_count u32
//! directory  stream_count x { type_tag u32, offset u32, length u32 }
//! streams    payloads in directory order, contiguous
//! trailer    crc32 u32 over every preceding byte
//! ```
//!
//! All integers are little-endian. The sizes below are shared by the writer, which plans a
//! dump before writing any byte of it, and the parser.

use crate::crash_info::{
    CrashRecord, MemoryRegionView, ModuleInfo, RegisterSet, ThreadView, MAX_REGISTERS,
};
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

pub const MAGIC: [u8; 4] = *b"CDMP";
pub const HEADER_SIZE: usize = 12;
pub const DIRECTORY_ENTRY_SIZE: usize = 12;
pub const CHECKSUM_SIZE: usize = 4;

#[repr(u32)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize,
)]
pub enum StreamType {
    ExceptionContext = 1,
    ThreadList = 2,
    ModuleList = 3,
    MemoryRegion = 4,
}

pub fn registers_size(registers: &RegisterSet) -> usize {
    8 + 8 * registers.values().len()
}

/// signal, si_code, pid, tid, fault address, ip, timestamp, flags, threads seen, registers.
pub fn context_size(record: &CrashRecord) -> usize {
    48 + registers_size(&record.context().registers)
}

pub fn thread_size(thread: &ThreadView) -> usize {
    12 + registers_size(&thread.snapshot.registers) + 16 * thread.frames.len()
}

pub fn module_size(module: &ModuleInfo) -> usize {
    24 + module.build_id().len() + module.path().len()
}

pub fn region_size(region: &MemoryRegionView) -> usize {
    12 + region.bytes.len()
}

/// Smallest dump that can hold a context: one stream, registers at their largest.
pub const fn minimal_dump_size() -> usize {
    HEADER_SIZE + DIRECTORY_ENTRY_SIZE + 48 + 8 + 8 * MAX_REGISTERS + CHECKSUM_SIZE
}
