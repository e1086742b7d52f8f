// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod record;
mod sig_info;

pub use record::*;
pub use sig_info::*;
