// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Builds a [`CrashRecord`] from a fault.
//!
//! Capture is best effort and bounded by a deadline: each step that fails or runs out of time
//! marks the record with a flag and the capture carries on with what it has. Everything used
//! here is allocated when the engine is created, so [`CaptureEngine::capture`] can run inside a
//! signal handler.

use crate::collector::memory_reader::{MemoryReader, ProcessMemoryReader};
use crate::collector::modules::{enumerate_modules, read_build_ids};
use crate::collector::thread_list::{list_threads, ThreadSuspender};
use crate::crash_info::{
    Arch, CaptureFlags, CaptureLimits, CrashRecord, FaultContext, RegisterSet, ThreadFlags,
};
use crate::shared::constants::{IP_REGION_BYTES, STACK_RED_ZONE};
use crashdump_common::timeout::TimeoutManager;
use std::time::Duration;

const SCRATCH_BYTES: usize = 8 * 1024;
/// Upper bound on the threads listed from `/proc`, recorded or not.
const MAX_LISTED_THREADS: usize = 16 * 1024;
/// Share of the capture deadline given to parking the other threads.
const SUSPEND_SHARE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub limits: CaptureLimits,
    pub max_stack_depth: usize,
    pub stack_capture_bytes: usize,
    pub timeout: Duration,
    pub suspend_signal: i32,
}

pub struct CaptureEngine<R: MemoryReader = ProcessMemoryReader> {
    settings: CaptureSettings,
    record: CrashRecord,
    reader: R,
    suspender: ThreadSuspender,
    tids: Vec<libc::pid_t>,
    dir_scratch: Box<[u8]>,
    maps_scratch: Box<[u8]>,
}

impl CaptureEngine<ProcessMemoryReader> {
    pub fn new(settings: CaptureSettings) -> nix::Result<Self> {
        Ok(Self::with_reader(ProcessMemoryReader::new()?, settings))
    }
}

impl<R: MemoryReader> CaptureEngine<R> {
    pub fn with_reader(reader: R, settings: CaptureSettings) -> Self {
        Self {
            record: CrashRecord::with_limits(&settings.limits),
            reader,
            suspender: ThreadSuspender::new(
                settings.suspend_signal,
                settings.limits.max_threads.saturating_sub(1),
            ),
            tids: Vec::with_capacity(MAX_LISTED_THREADS),
            dir_scratch: vec![0u8; SCRATCH_BYTES].into_boxed_slice(),
            maps_scratch: vec![0u8; SCRATCH_BYTES].into_boxed_slice(),
            settings,
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn record(&self) -> &CrashRecord {
        &self.record
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// Captures the process state for `fault`.
    ///
    /// Other threads stay parked after this returns, so the record describes one instant;
    /// call [`CaptureEngine::release_threads`] once the record has been written out.
    pub fn capture(&mut self, fault: FaultContext) -> &CrashRecord {
        let deadline = TimeoutManager::new(self.settings.timeout);
        self.record.clear();
        self.record.set_context(fault);

        // Modules first: the stack walks use them to reject bogus return addresses.
        if !enumerate_modules(&mut self.record, &mut self.maps_scratch) {
            self.record.add_flags(CaptureFlags::PARTIAL_MODULE_LIST);
        }
        read_build_ids(&mut self.record, &self.reader);

        if !list_threads(&mut self.dir_scratch, &mut self.tids) {
            self.record.add_flags(CaptureFlags::PARTIAL_THREAD_LIST);
        }
        let fault_tid = fault.tid as libc::pid_t;
        let mut seen = self.tids.len();
        if !self.tids.contains(&fault_tid) {
            seen += 1;
        }
        self.record.set_threads_seen(seen as u32);

        let suspend_deadline = deadline.bounded(self.settings.timeout / SUSPEND_SHARE);
        if !self
            .suspender
            .suspend_all(&self.tids, fault_tid, &suspend_deadline)
        {
            self.record.add_flags(CaptureFlags::PARTIAL_THREAD_LIST);
        }

        self.capture_faulting_thread(&fault);
        self.capture_other_threads(fault_tid, &deadline);
        &self.record
    }

    fn capture_faulting_thread(&mut self, fault: &FaultContext) {
        let registers = fault.registers;
        let flags = if registers.is_empty() {
            ThreadFlags::empty()
        } else {
            ThreadFlags::REGISTERS_VALID
        };
        if !self.record.push_thread(fault.tid, registers, flags) {
            self.record.add_flags(CaptureFlags::PARTIAL_THREAD_LIST);
            return;
        }
        self.record
            .record_stack(&registers, &self.reader, self.settings.max_stack_depth);
        self.capture_memory(&registers);
    }

    /// Records the faulting thread's stack and the code around its instruction pointer.
    fn capture_memory(&mut self, registers: &RegisterSet) {
        let sp = registers.stack_pointer();
        if sp != 0 && self.settings.stack_capture_bytes > 0 {
            let red_zone = if registers.arch() == Arch::X86_64 {
                STACK_RED_ZONE
            } else {
                0
            };
            let start = sp.saturating_sub(red_zone);
            let reader = &self.reader;
            self.record
                .push_memory(start, self.settings.stack_capture_bytes, |buf| {
                    reader.read_prefix(start, buf)
                });
        }
        let ip = registers.instruction_pointer();
        if ip != 0 {
            let start = ip.saturating_sub(IP_REGION_BYTES as u64 / 2);
            let reader = &self.reader;
            self.record.push_memory(start, IP_REGION_BYTES, |buf| {
                reader.read_prefix(start, buf)
            });
        }
    }

    fn capture_other_threads(&mut self, fault_tid: libc::pid_t, deadline: &TimeoutManager) {
        for i in 0..self.tids.len() {
            let tid = self.tids[i];
            if tid == fault_tid {
                continue;
            }
            if deadline.expired() {
                self.record
                    .add_flags(CaptureFlags::CAPTURE_TIMED_OUT | CaptureFlags::PARTIAL_THREAD_LIST);
                return;
            }
            let registers = self.suspender.registers_of(tid);
            let flags = if registers.is_some() {
                ThreadFlags::REGISTERS_VALID
            } else {
                self.record.add_flags(CaptureFlags::PARTIAL_THREAD_LIST);
                ThreadFlags::empty()
            };
            let registers = registers.unwrap_or_default();
            if !self.record.push_thread(tid as u32, registers, flags) {
                self.record.add_flags(CaptureFlags::PARTIAL_THREAD_LIST);
                return;
            }
            if flags.contains(ThreadFlags::REGISTERS_VALID) {
                self.record
                    .record_stack(&registers, &self.reader, self.settings.max_stack_depth);
            }
        }
    }

    /// Lets the threads parked by the last capture continue.
    pub fn release_threads(&mut self) {
        self.suspender.resume_all();
    }
}
