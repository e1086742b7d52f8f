// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Everything that runs in the crashing process: the trap, the capture engine and the pieces
//! it reads the process with.

#[cfg(target_os = "linux")]
mod capture;
#[cfg(target_os = "linux")]
mod crash_handler;
mod frame_pointer_walker;
mod memory_reader;
#[cfg(target_os = "linux")]
mod modules;
mod platform;
#[cfg(target_os = "linux")]
mod saguard;
#[cfg(target_os = "linux")]
mod signal_handler_manager;
#[cfg(target_os = "linux")]
mod thread_list;

#[cfg(target_os = "linux")]
pub use capture::{CaptureEngine, CaptureSettings};
#[cfg(target_os = "linux")]
pub use crash_handler::{CaptureError, CrashHandler, DumpCallback, InstallError};
pub use frame_pointer_walker::*;
pub use memory_reader::*;
#[cfg(target_os = "linux")]
pub use modules::{parse_maps_line, read_build_id, MapsEntry};
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use platform::current_registers;
pub use platform::WORD_SIZE;

/// Tests that park threads share the process-wide suspend session, so they run one at a time.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn suspend_test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
