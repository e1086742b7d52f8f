// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The other side of the handoff: finding completed dumps after the crashing process is gone.

mod watcher;

pub use watcher::{is_complete_dump, DumpWatcher};
