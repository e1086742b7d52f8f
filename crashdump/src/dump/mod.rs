// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The dump container: its layout, the allocation-free writer used at crash time, and the
//! parser used by whoever picks the files up.

#[cfg(target_os = "linux")]
mod destination;
mod format;
mod reader;
#[cfg(test)]
pub(crate) mod test_utils;
#[cfg(unix)]
mod writer;

#[cfg(target_os = "linux")]
pub use destination::*;
pub use format::{minimal_dump_size, StreamType, MAGIC};
pub use reader::*;
#[cfg(unix)]
pub use writer::*;
