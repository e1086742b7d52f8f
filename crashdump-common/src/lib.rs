// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Utilities shared between the crashdump library, its watcher and its test binaries.

pub mod timeout;
#[cfg(unix)]
pub mod unix_utils;
