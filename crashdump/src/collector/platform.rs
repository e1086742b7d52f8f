// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Architecture specific register access.
//!
//! Registers are stored in the canonical order of [`Arch::register_names`]:
//! x86_64 keeps `rax..r15, rip, eflags`, aarch64 keeps `x0..x30, sp, pc, pstate`.

use crate::crash_info::{Arch, RegisterSet};
#[cfg(target_os = "linux")]
use libc::ucontext_t;

/// Size of a stack slot, and the alignment every frame pointer must have.
pub const WORD_SIZE: u64 = std::mem::size_of::<usize>() as u64;

/// Copies the general purpose registers out of a signal `ucontext`.
///
/// # Safety
/// `ucontext` must be null or point to the context the kernel handed to a signal handler.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub unsafe fn registers_from_ucontext(ucontext: *const ucontext_t) -> RegisterSet {
    if ucontext.is_null() {
        return RegisterSet::empty();
    }
    let gregs = &(*ucontext).uc_mcontext.gregs;
    let order = [
        libc::REG_RAX,
        libc::REG_RBX,
        libc::REG_RCX,
        libc::REG_RDX,
        libc::REG_RSI,
        libc::REG_RDI,
        libc::REG_RBP,
        libc::REG_RSP,
        libc::REG_R8,
        libc::REG_R9,
        libc::REG_R10,
        libc::REG_R11,
        libc::REG_R12,
        libc::REG_R13,
        libc::REG_R14,
        libc::REG_R15,
        libc::REG_RIP,
        libc::REG_EFL,
    ];
    let mut values = [0u64; 18];
    for (value, reg) in values.iter_mut().zip(order) {
        *value = gregs[reg as usize] as u64;
    }
    RegisterSet::new(Arch::X86_64, &values)
}

/// Copies the general purpose registers out of a signal `ucontext`.
///
/// # Safety
/// `ucontext` must be null or point to the context the kernel handed to a signal handler.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub unsafe fn registers_from_ucontext(ucontext: *const ucontext_t) -> RegisterSet {
    if ucontext.is_null() {
        return RegisterSet::empty();
    }
    let mcontext = &(*ucontext).uc_mcontext;
    let mut values = [0u64; 34];
    for (value, reg) in values.iter_mut().zip(mcontext.regs.iter()) {
        *value = *reg as u64;
    }
    values[31] = mcontext.sp as u64;
    values[32] = mcontext.pc as u64;
    values[33] = mcontext.pstate as u64;
    RegisterSet::new(Arch::Aarch64, &values)
}

/// Instruction, stack and frame pointer of the caller.
///
/// Inlined so the snapshot describes the frame that called it rather than a helper frame.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn current_registers() -> RegisterSet {
    let (ip, sp, fp): (u64, u64, u64);
    // Safety: only reads registers.
    unsafe {
        std::arch::asm!(
            "lea {ip}, [rip]",
            "mov {sp}, rsp",
            "mov {fp}, rbp",
            ip = out(reg) ip,
            sp = out(reg) sp,
            fp = out(reg) fp,
            options(nomem, nostack, preserves_flags),
        );
    }
    RegisterSet::from_parts(Arch::X86_64, ip, sp, fp)
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn current_registers() -> RegisterSet {
    let (ip, sp, fp): (u64, u64, u64);
    // Safety: only reads registers.
    unsafe {
        std::arch::asm!(
            "adr {ip}, .",
            "mov {sp}, sp",
            "mov {fp}, x29",
            ip = out(reg) ip,
            sp = out(reg) sp,
            fp = out(reg) fp,
            options(nomem, nostack, preserves_flags),
        );
    }
    RegisterSet::from_parts(Arch::Aarch64, ip, sp, fp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_current_registers() {
        let regs = current_registers();
        assert_eq!(regs.arch(), Arch::current());
        let local = 0u64;
        let local_addr = std::ptr::addr_of!(local) as u64;
        // The stack pointer sits below every local of this frame.
        assert!(regs.stack_pointer() <= local_addr);
        assert_ne!(regs.instruction_pointer(), 0);
        assert_eq!(regs.stack_pointer() % WORD_SIZE, 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_null_ucontext() {
        // Safety: null is explicitly allowed.
        let regs = unsafe { registers_from_ucontext(std::ptr::null()) };
        assert!(regs.is_empty());
    }
}
