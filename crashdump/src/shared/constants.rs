// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const DUMP_FORMAT_VERSION: u32 = 1;

pub const DEFAULT_DUMP_DIR: &str = "/minidumps";
pub const DEFAULT_MAX_DUMP_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_STACK_DEPTH: usize = 256;
pub const DEFAULT_MAX_THREADS: usize = 256;
pub const DEFAULT_MAX_MODULES: usize = 512;
pub const DEFAULT_STACK_CAPTURE_BYTES: usize = 32 * 1024;
pub const DEFAULT_ALT_STACK_PAGES: usize = 32;
/// Offset from `SIGRTMIN` of the signal used to park threads during a capture.
pub const DEFAULT_SUSPEND_SIGNAL_OFFSET: i32 = 7;

/// Bytes captured around the faulting instruction pointer.
pub const IP_REGION_BYTES: usize = 256;
/// The x86_64 SysV ABI lets leaf functions use 128 bytes below the stack pointer.
pub const STACK_RED_ZONE: u64 = 128;
/// Faulting stack plus the bytes around the instruction pointer.
pub const MAX_MEMORY_REGIONS: usize = 2;

/// Upper bound on a dump, so every offset fits in the u32 directory fields.
pub const MAX_DUMP_BYTES_LIMIT: usize = u32::MAX as usize;

pub const ENV_DUMP_DIR: &str = "CRASHDUMP_DIR";
pub const ENV_MAX_BYTES: &str = "CRASHDUMP_MAX_BYTES";
pub const ENV_TIMEOUT_MS: &str = "CRASHDUMP_TIMEOUT_MS";
pub const ENV_CHAIN_PREVIOUS: &str = "CRASHDUMP_CHAIN_PREVIOUS";
pub const ENV_RETHROW: &str = "CRASHDUMP_RETHROW";
pub const ENV_MAX_DEPTH: &str = "CRASHDUMP_MAX_DEPTH";

pub const DUMP_EXTENSION: &str = "dmp";
pub const DUMP_SUFFIX: &str = ".dmp";
pub const PARTIAL_DUMP_SUFFIX: &str = ".dmp.tmp";
