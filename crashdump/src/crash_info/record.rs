// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The crash record: everything captured about the process at the instant of a fault.
//!
//! Every collection inside a [`CrashRecord`] is a `Vec` reserved to its final capacity when the
//! record is created. Pushes that would exceed that capacity are refused rather than triggering a
//! reallocation, which is what makes it legal to fill a record from inside a signal handler.

use crate::collector::{walk, MemoryReader, StopReason};
use crate::shared::constants::DUMP_FORMAT_VERSION;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_REGISTERS: usize = 34;
pub const MAX_BUILD_ID_LEN: usize = 32;
pub const MAX_PATH_LEN: usize = 255;

#[repr(u32)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize,
)]
pub enum Arch {
    Unknown = 0,
    X86_64 = 1,
    Aarch64 = 2,
}

const X86_64_REGISTERS: [&str; 18] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip", "eflags",
];

const AARCH64_REGISTERS: [&str; 34] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp", "pc", "pstate",
];

impl Arch {
    pub const fn current() -> Arch {
        if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else {
            Arch::Unknown
        }
    }

    pub fn register_names(self) -> &'static [&'static str] {
        match self {
            Arch::X86_64 => &X86_64_REGISTERS,
            Arch::Aarch64 => &AARCH64_REGISTERS,
            Arch::Unknown => &[],
        }
    }

    /// Indices of (instruction pointer, stack pointer, frame pointer) in the register file.
    const fn special_indices(self) -> Option<(usize, usize, usize)> {
        match self {
            Arch::X86_64 => Some((16, 7, 6)),
            Arch::Aarch64 => Some((32, 31, 29)),
            Arch::Unknown => None,
        }
    }
}

/// A fixed-size snapshot of one thread's general purpose registers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegisterSet {
    arch: Arch,
    count: u32,
    values: [u64; MAX_REGISTERS],
}

impl RegisterSet {
    pub const fn empty() -> Self {
        Self {
            arch: Arch::Unknown,
            count: 0,
            values: [0; MAX_REGISTERS],
        }
    }

    /// Builds a register set from raw values in the architecture's canonical order.
    /// Values beyond [`MAX_REGISTERS`] are dropped.
    pub fn new(arch: Arch, values: &[u64]) -> Self {
        let count = values.len().min(MAX_REGISTERS);
        let mut set = Self {
            arch,
            count: count as u32,
            values: [0; MAX_REGISTERS],
        };
        set.values[..count].copy_from_slice(&values[..count]);
        set
    }

    /// A register set where only the instruction, stack and frame pointers are known.
    pub fn from_parts(arch: Arch, ip: u64, sp: u64, fp: u64) -> Self {
        let mut set = Self {
            arch,
            count: arch.register_names().len() as u32,
            values: [0; MAX_REGISTERS],
        };
        if let Some((ip_idx, sp_idx, fp_idx)) = arch.special_indices() {
            set.values[ip_idx] = ip;
            set.values[sp_idx] = sp;
            set.values[fp_idx] = fp;
        }
        set
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn values(&self) -> &[u64] {
        &self.values[..self.count as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn special(&self, pick: fn((usize, usize, usize)) -> usize) -> u64 {
        self.arch
            .special_indices()
            .map(pick)
            .filter(|idx| *idx < self.count as usize)
            .map(|idx| self.values[idx])
            .unwrap_or(0)
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.special(|(ip, _, _)| ip)
    }

    pub fn stack_pointer(&self) -> u64 {
        self.special(|(_, sp, _)| sp)
    }

    pub fn frame_pointer(&self) -> u64 {
        self.special(|(_, _, fp)| fp)
    }

    /// Pairs each value with its register name.
    pub fn named(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        let names = self.arch.register_names();
        self.values()
            .iter()
            .enumerate()
            .map(move |(i, v)| (names.get(i).copied().unwrap_or("?"), *v))
    }
}

impl Default for RegisterSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        map.entry(&"arch", &self.arch);
        for (name, value) in self.named() {
            map.entry(&name, &format_args!("{value:#018x}"));
        }
        map.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub return_address: u64,
    pub frame_base: Option<u64>,
}

/// The state of the faulting thread at the moment the trap fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultContext {
    /// Signal number, 0 for a dump requested without a fault.
    pub signal: i32,
    pub si_code: i32,
    pub pid: u32,
    pub tid: u32,
    pub fault_address: u64,
    pub instruction_pointer: u64,
    pub timestamp_ns: u64,
    pub registers: RegisterSet,
}

impl FaultContext {
    pub const fn empty() -> Self {
        Self {
            signal: 0,
            si_code: 0,
            pid: 0,
            tid: 0,
            fault_address: 0,
            instruction_pointer: 0,
            timestamp_ns: 0,
            registers: RegisterSet::empty(),
        }
    }
}

impl Default for FaultContext {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags::bitflags! {
    /// How complete a capture is, and what the serializer had to leave out.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct CaptureFlags: u32 {
        const PARTIAL_THREAD_LIST = 1 << 0;
        const PARTIAL_MODULE_LIST = 1 << 1;
        const WALK_TRUNCATED = 1 << 2;
        const CAPTURE_TIMED_OUT = 1 << 3;
        const MEMORY_DROPPED = 1 << 4;
        const OTHER_THREADS_DROPPED = 1 << 5;
        const MODULES_DROPPED = 1 << 6;
        const THREADS_DROPPED = 1 << 7;
        const MINIMAL_FALLBACK = 1 << 8;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ThreadFlags: u32 {
        const REGISTERS_VALID = 1 << 0;
        const WALK_TRUNCATED = 1 << 1;
    }
}

/// A loaded code module. Path and build id live inline so the list never allocates.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    pub base: u64,
    pub size: u64,
    build_id: [u8; MAX_BUILD_ID_LEN],
    build_id_len: u8,
    path: [u8; MAX_PATH_LEN],
    path_len: u8,
}

impl ModuleInfo {
    /// Over-long paths and build ids are truncated.
    pub fn new(base: u64, size: u64, path: &[u8], build_id: &[u8]) -> Self {
        let mut module = Self {
            base,
            size,
            build_id: [0; MAX_BUILD_ID_LEN],
            build_id_len: 0,
            path: [0; MAX_PATH_LEN],
            path_len: 0,
        };
        let path_len = path.len().min(MAX_PATH_LEN);
        module.path[..path_len].copy_from_slice(&path[..path_len]);
        module.path_len = path_len as u8;
        module.set_build_id(build_id);
        module
    }

    pub fn set_build_id(&mut self, build_id: &[u8]) {
        let len = build_id.len().min(MAX_BUILD_ID_LEN);
        self.build_id[..len].copy_from_slice(&build_id[..len]);
        self.build_id_len = len as u8;
    }

    pub fn build_id(&self) -> &[u8] {
        &self.build_id[..self.build_id_len as usize]
    }

    pub fn path(&self) -> &[u8] {
        &self.path[..self.path_len as usize]
    }

    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

impl fmt::Debug for ModuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInfo")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("path", &String::from_utf8_lossy(self.path()))
            .field("build_id", &HexBytes(self.build_id()))
            .finish()
    }
}

pub(crate) struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub tid: u32,
    pub flags: ThreadFlags,
    pub registers: RegisterSet,
    frames_start: usize,
    frames_len: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ThreadView<'a> {
    pub snapshot: &'a ThreadSnapshot,
    pub frames: &'a [Frame],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MemoryRegion {
    start: u64,
    offset: usize,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryRegionView<'a> {
    pub start: u64,
    pub bytes: &'a [u8],
}

/// Capacities of a [`CrashRecord`]. Nothing beyond these is ever recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    pub max_threads: usize,
    pub max_frames_per_thread: usize,
    pub max_modules: usize,
    pub max_memory_regions: usize,
    pub memory_bytes: usize,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        use crate::shared::constants::*;
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            max_frames_per_thread: DEFAULT_MAX_STACK_DEPTH,
            max_modules: DEFAULT_MAX_MODULES,
            max_memory_regions: MAX_MEMORY_REGIONS,
            memory_bytes: DEFAULT_STACK_CAPTURE_BYTES + IP_REGION_BYTES,
        }
    }
}

pub struct CrashRecord {
    format_version: u32,
    context: FaultContext,
    flags: CaptureFlags,
    threads_seen: u32,
    max_frames_per_thread: usize,
    threads: Vec<ThreadSnapshot>,
    frames: Vec<Frame>,
    modules: Vec<ModuleInfo>,
    regions: Vec<MemoryRegion>,
    memory: Vec<u8>,
}

impl CrashRecord {
    pub fn with_limits(limits: &CaptureLimits) -> Self {
        Self {
            format_version: DUMP_FORMAT_VERSION,
            context: FaultContext::empty(),
            flags: CaptureFlags::empty(),
            threads_seen: 0,
            max_frames_per_thread: limits.max_frames_per_thread,
            threads: Vec::with_capacity(limits.max_threads),
            frames: Vec::with_capacity(
                limits
                    .max_threads
                    .saturating_mul(limits.max_frames_per_thread),
            ),
            modules: Vec::with_capacity(limits.max_modules),
            regions: Vec::with_capacity(limits.max_memory_regions),
            memory: Vec::with_capacity(limits.memory_bytes),
        }
    }

    /// Forgets everything recorded, keeping the reserved capacity.
    pub fn clear(&mut self) {
        self.context = FaultContext::empty();
        self.flags = CaptureFlags::empty();
        self.threads_seen = 0;
        self.threads.clear();
        self.frames.clear();
        self.modules.clear();
        self.regions.clear();
        self.memory.clear();
    }

    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    pub fn context(&self) -> &FaultContext {
        &self.context
    }

    pub fn set_context(&mut self, context: FaultContext) {
        self.context = context;
    }

    pub fn flags(&self) -> CaptureFlags {
        self.flags
    }

    pub fn add_flags(&mut self, flags: CaptureFlags) {
        self.flags.insert(flags);
    }

    /// Number of threads that existed at capture time, recorded or not.
    pub fn threads_seen(&self) -> u32 {
        self.threads_seen
    }

    pub fn set_threads_seen(&mut self, threads_seen: u32) {
        self.threads_seen = threads_seen;
    }

    /// Returns `false`, recording nothing, when the thread list is full.
    pub fn push_thread(&mut self, tid: u32, registers: RegisterSet, flags: ThreadFlags) -> bool {
        if self.threads.len() == self.threads.capacity() {
            return false;
        }
        self.threads.push(ThreadSnapshot {
            tid,
            flags,
            registers,
            frames_start: self.frames.len(),
            frames_len: 0,
        });
        true
    }

    /// Appends a frame to the most recently pushed thread.
    pub fn push_frame(&mut self, frame: Frame) -> bool {
        let Some(thread) = self.threads.last_mut() else {
            return false;
        };
        if thread.frames_len >= self.max_frames_per_thread
            || self.frames.len() == self.frames.capacity()
        {
            return false;
        }
        self.frames.push(frame);
        thread.frames_len += 1;
        true
    }

    /// Walks the stack described by `registers` and appends the frames to the most recently
    /// pushed thread. Return addresses outside the recorded modules end the walk.
    pub fn record_stack<R: MemoryReader + ?Sized>(
        &mut self,
        registers: &RegisterSet,
        reader: &R,
        max_depth: usize,
    ) -> StopReason {
        let Some(thread) = self.threads.last_mut() else {
            return StopReason::EndOfStack;
        };
        let modules: &[ModuleInfo] = &self.modules;
        let mut walker = walk(registers, reader, max_depth).with_code_ranges(modules);
        let mut out_of_space = false;
        for step in &mut walker {
            let Ok(frame) = step else { break };
            if thread.frames_len >= self.max_frames_per_thread
                || self.frames.len() == self.frames.capacity()
            {
                out_of_space = true;
                break;
            }
            self.frames.push(frame);
            thread.frames_len += 1;
        }
        let reason = if out_of_space {
            StopReason::DepthLimit
        } else {
            walker.stop_reason()
        };
        if reason.is_truncation() {
            thread.flags.insert(ThreadFlags::WALK_TRUNCATED);
            self.flags.insert(CaptureFlags::WALK_TRUNCATED);
        }
        reason
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn threads(&self) -> impl ExactSizeIterator<Item = ThreadView<'_>> + '_ {
        self.threads.iter().map(|snapshot| ThreadView {
            snapshot,
            frames: &self.frames
                [snapshot.frames_start..snapshot.frames_start + snapshot.frames_len],
        })
    }

    /// The faulting thread is always recorded first.
    pub fn faulting_thread(&self) -> Option<ThreadView<'_>> {
        self.threads()
            .next()
            .filter(|t| t.snapshot.tid == self.context.tid)
    }

    pub fn push_module(&mut self, module: ModuleInfo) -> bool {
        if self.modules.len() == self.modules.capacity() {
            return false;
        }
        self.modules.push(module);
        true
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut [ModuleInfo] {
        &mut self.modules
    }

    /// Reserves up to `max_len` bytes of the memory pool for a region starting at `start`.
    /// `fill` writes the region and returns how many leading bytes are valid; a region with no
    /// valid bytes is discarded. Returns whether a region was recorded.
    pub fn push_memory(
        &mut self,
        start: u64,
        max_len: usize,
        fill: impl FnOnce(&mut [u8]) -> usize,
    ) -> bool {
        if self.regions.len() == self.regions.capacity() {
            return false;
        }
        let offset = self.memory.len();
        let len = max_len.min(self.memory.capacity() - offset);
        if len == 0 {
            return false;
        }
        // Stays within the reserved capacity, so this never reallocates.
        self.memory.resize(offset + len, 0);
        let valid = fill(&mut self.memory[offset..]).min(len);
        self.memory.truncate(offset + valid);
        if valid == 0 {
            return false;
        }
        self.regions.push(MemoryRegion {
            start,
            offset,
            len: valid,
        });
        true
    }

    pub fn memory_regions(&self) -> impl ExactSizeIterator<Item = MemoryRegionView<'_>> + '_ {
        self.regions.iter().map(|r| MemoryRegionView {
            start: r.start,
            bytes: &self.memory[r.offset..r.offset + r.len],
        })
    }
}

impl fmt::Debug for CrashRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashRecord")
            .field("format_version", &self.format_version)
            .field("context", &self.context)
            .field("flags", &self.flags)
            .field("threads_seen", &self.threads_seen)
            .field("threads", &self.threads.len())
            .field("frames", &self.frames.len())
            .field("modules", &self.modules.len())
            .field("memory_regions", &self.regions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limits() -> CaptureLimits {
        CaptureLimits {
            max_threads: 2,
            max_frames_per_thread: 3,
            max_modules: 1,
            max_memory_regions: 2,
            memory_bytes: 16,
        }
    }

    #[test]
    fn test_register_set_special_registers() {
        let regs = RegisterSet::from_parts(Arch::X86_64, 0x1000, 0x2000, 0x3000);
        assert_eq!(regs.instruction_pointer(), 0x1000);
        assert_eq!(regs.stack_pointer(), 0x2000);
        assert_eq!(regs.frame_pointer(), 0x3000);
        assert_eq!(regs.values().len(), 18);
        assert_eq!(regs.named().nth(16), Some(("rip", 0x1000)));

        let regs = RegisterSet::from_parts(Arch::Aarch64, 1, 2, 3);
        assert_eq!(regs.values().len(), 34);
        assert_eq!(regs.named().nth(29), Some(("x29", 3)));
        assert_eq!(regs.instruction_pointer(), 1);
    }

    #[test]
    fn test_register_set_truncates_and_handles_unknown() {
        let regs = RegisterSet::new(Arch::Unknown, &[7; 40]);
        assert_eq!(regs.values().len(), MAX_REGISTERS);
        assert_eq!(regs.instruction_pointer(), 0);
        assert!(RegisterSet::empty().is_empty());
    }

    #[test]
    fn test_flags() {
        let mut flags = CaptureFlags::empty();
        assert!(flags.is_empty());
        flags.insert(CaptureFlags::WALK_TRUNCATED);
        flags.insert(CaptureFlags::MODULES_DROPPED);
        assert!(flags.contains(CaptureFlags::WALK_TRUNCATED));
        assert!(!flags.contains(CaptureFlags::PARTIAL_THREAD_LIST));
        assert_eq!(
            flags.iter_names().map(|(name, _)| name).collect::<Vec<_>>(),
            vec!["WALK_TRUNCATED", "MODULES_DROPPED"]
        );
        assert_eq!(CaptureFlags::from_bits_retain(flags.bits()), flags);

        // Bits a newer writer sets survive a round trip but carry no name.
        let future =
            CaptureFlags::from_bits_retain(CaptureFlags::MINIMAL_FALLBACK.bits() | 1 << 20);
        assert_eq!(future.bits() & (1 << 20), 1 << 20);
        assert_eq!(
            future.iter_names().map(|(name, _)| name).collect::<Vec<_>>(),
            vec!["MINIMAL_FALLBACK"]
        );
        assert_eq!(
            ThreadFlags::all(),
            ThreadFlags::REGISTERS_VALID | ThreadFlags::WALK_TRUNCATED
        );
    }

    #[test]
    fn test_module_info_truncates() {
        let long_path = vec![b'a'; 400];
        let module = ModuleInfo::new(0x1000, 0x100, &long_path, &[1; 40]);
        assert_eq!(module.path().len(), MAX_PATH_LEN);
        assert_eq!(module.build_id().len(), MAX_BUILD_ID_LEN);
        assert!(module.contains(0x1000));
        assert!(module.contains(0x10ff));
        assert!(!module.contains(0x1100));
    }

    #[test]
    fn test_record_respects_capacities() {
        let mut record = CrashRecord::with_limits(&small_limits());
        assert!(!record.push_frame(Frame {
            return_address: 1,
            frame_base: None
        }));

        assert!(record.push_thread(1, RegisterSet::empty(), ThreadFlags::empty()));
        for i in 0..3 {
            assert!(record.push_frame(Frame {
                return_address: i + 1,
                frame_base: None
            }));
        }
        assert!(!record.push_frame(Frame {
            return_address: 9,
            frame_base: None
        }));
        assert!(record.push_thread(2, RegisterSet::empty(), ThreadFlags::empty()));
        assert!(!record.push_thread(3, RegisterSet::empty(), ThreadFlags::empty()));

        assert!(record.push_module(ModuleInfo::new(0, 1, b"a", &[])));
        assert!(!record.push_module(ModuleInfo::new(1, 1, b"b", &[])));

        let threads: Vec<_> = record.threads().collect();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].frames.len(), 3);
        assert_eq!(threads[1].frames.len(), 0);
    }

    #[test]
    fn test_push_memory() {
        let mut record = CrashRecord::with_limits(&small_limits());
        assert!(record.push_memory(0x100, 10, |buf| {
            buf.fill(0xab);
            buf.len()
        }));
        // Only 6 bytes of the pool are left.
        assert!(record.push_memory(0x200, 10, |buf| {
            assert_eq!(buf.len(), 6);
            buf.fill(0xcd);
            4
        }));
        // Region limit reached.
        assert!(!record.push_memory(0x300, 1, |_| 1));

        let regions: Vec<_> = record.memory_regions().collect();
        assert_eq!(regions[0].start, 0x100);
        assert_eq!(regions[0].bytes, &[0xab; 10]);
        assert_eq!(regions[1].bytes, &[0xcd; 4]);
    }

    #[test]
    fn test_unreadable_memory_region_is_discarded() {
        let mut record = CrashRecord::with_limits(&small_limits());
        assert!(!record.push_memory(0x100, 8, |_| 0));
        assert_eq!(record.memory_regions().len(), 0);
        assert!(record.push_memory(0x100, 8, |buf| buf.len()));
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut record = CrashRecord::with_limits(&small_limits());
        record.push_thread(1, RegisterSet::empty(), ThreadFlags::empty());
        record.add_flags(CaptureFlags::PARTIAL_MODULE_LIST);
        record.clear();
        assert_eq!(record.thread_count(), 0);
        assert!(record.flags().is_empty());
        assert!(record.push_thread(1, RegisterSet::empty(), ThreadFlags::empty()));
        assert!(record.push_thread(2, RegisterSet::empty(), ThreadFlags::empty()));
    }

    #[test]
    fn test_faulting_thread_is_first() {
        let mut record = CrashRecord::with_limits(&small_limits());
        record.set_context(FaultContext {
            tid: 42,
            ..FaultContext::empty()
        });
        assert!(record.faulting_thread().is_none());
        record.push_thread(42, RegisterSet::empty(), ThreadFlags::REGISTERS_VALID);
        record.push_thread(7, RegisterSet::empty(), ThreadFlags::empty());
        assert_eq!(record.faulting_thread().unwrap().snapshot.tid, 42);
    }
}
