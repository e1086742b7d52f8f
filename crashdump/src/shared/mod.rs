// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration and constants shared by the collector, the serializer and the watcher.

pub mod configuration;
pub mod constants;
