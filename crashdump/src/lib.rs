// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! This crate implements an in-process crash capture engine: it catches fatal signals and
//! writes a self-validating binary dump of the crashing process before letting it die.
//!
//! Architecturally, it consists of four parts:
//! 1. A signal trap ([`CrashHandler`]), installed once per process. Everything a capture needs
//!    is allocated at install time: the crash record, the thread park slots, the `/proc`
//!    scratch buffers, an alternate signal stack, and the dump destination. The handler body
//!    does not allocate, does not lock, and only calls async-signal-safe functions.
//!    <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! 2. A capture engine, which runs on the faulting thread. It parks every other thread with
//!    a real-time signal to copy its registers, enumerates loaded modules with their build ids,
//!    and walks each stack. Anything it cannot get is recorded as a flag instead of failing
//!    the capture, and the whole capture is bounded by a timeout.
//! 3. A frame pointer stack walker over a fallible memory reader. Reads go through
//!    `process_vm_readv(2)`, so a corrupted stack ends the walk with a typed error rather than
//!    a second fault.
//! 4. A dump serializer that sizes every stream before writing the first byte, drops streams
//!    in a fixed order when the record is over the size limit, and ends the file with a
//!    CRC-32. In a dump directory, files are written as `.dmp.tmp` and renamed to `.dmp` once
//!    complete.
//!
//! After the capture the trap optionally chains to the previous handler, then re-raises the
//! signal with its default action or exits immediately.
//!
//! The post-crash side, [`receiver::DumpWatcher`] and [`dump::parse_dump`], picks completed
//! dumps up from another process.
//!
//! The collector is Linux only (x86_64 and aarch64). The container format, the parser and the
//! watcher are portable. Stacks are only as good as the frame pointers in the crashing code.

pub mod collector;
pub mod crash_info;
pub mod dump;
pub mod receiver;
pub mod shared;

#[cfg(target_os = "linux")]
pub use collector::{CaptureError, CrashHandler, DumpCallback, InstallError};
#[cfg(target_os = "linux")]
pub use dump::{DumpOutcome, DumpTarget};
pub use dump::{parse_dump, read_dump_file, DumpSummary, ParseError, ParsedDump};
pub use shared::configuration::{default_signals, Destination, HandlerConfig};
