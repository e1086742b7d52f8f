// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::{
    Arch, CaptureLimits, CrashRecord, FaultContext, Frame, ModuleInfo, RegisterSet, ThreadFlags,
};

/// A SIGSEGV record with two threads, one module and one memory region.
pub(crate) fn sample_record() -> CrashRecord {
    let mut record = CrashRecord::with_limits(&CaptureLimits::default());
    let registers = RegisterSet::from_parts(Arch::X86_64, 0x40_1000, 0x7ff0_0000, 0x7ff0_0100);
    record.set_context(FaultContext {
        signal: libc::SIGSEGV,
        si_code: 1,
        pid: 100,
        tid: 101,
        fault_address: 0xdead_beef,
        instruction_pointer: 0x40_1000,
        timestamp_ns: 1_700_000_000_000_000_000,
        registers,
    });
    record.set_threads_seen(2);
    record.push_thread(101, registers, ThreadFlags::REGISTERS_VALID);
    for addr in [0x40_1000, 0x40_2000, 0x40_3000] {
        record.push_frame(Frame {
            return_address: addr,
            frame_base: Some(addr + 0x7fb0_0000),
        });
    }
    record.push_thread(102, RegisterSet::empty(), ThreadFlags::empty());
    record.push_module(ModuleInfo::new(
        0x40_0000,
        0x10_0000,
        b"/bin/app",
        &[0xab; 20],
    ));
    record.push_memory(0x7ff0_0000, 64, |buf| {
        buf.fill(0x11);
        buf.len()
    });
    record
}
