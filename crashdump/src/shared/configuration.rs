// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::crash_info::CaptureLimits;
use crate::dump::minimal_dump_size;
use crate::shared::constants::*;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

/// Signals trapped when the configuration does not name any.
pub fn default_signals() -> Vec<i32> {
    vec![
        libc::SIGSEGV,
        libc::SIGBUS,
        libc::SIGILL,
        libc::SIGFPE,
        libc::SIGABRT,
        libc::SIGTRAP,
    ]
}

/// Where dumps are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// Each dump becomes its own file in this directory, created at install if missing.
    Directory(PathBuf),
    /// A descriptor owned by the caller. It must stay open while the handler is installed.
    Descriptor(RawFd),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    destination: Destination,
    max_dump_bytes: usize,
    signals: Vec<i32>,
    chain_previous: bool,
    rethrow_after_capture: bool,
    capture_timeout: Duration,
    max_stack_depth: usize,
    max_threads: usize,
    stack_capture_bytes: usize,
    alt_stack_size: Option<usize>,
    suspend_signal: Option<i32>,
}

impl HandlerConfig {
    pub fn new(
        destination: Destination,
        max_dump_bytes: usize,
        mut signals: Vec<i32>,
        chain_previous: bool,
        rethrow_after_capture: bool,
        capture_timeout: Duration,
    ) -> anyhow::Result<Self> {
        if let Destination::Descriptor(fd) = destination {
            anyhow::ensure!(fd >= 0, "Invalid dump descriptor {fd}");
        }
        check_max_dump_bytes(max_dump_bytes)?;
        anyhow::ensure!(
            !capture_timeout.is_zero(),
            "The capture timeout must be greater than zero"
        );
        if signals.is_empty() {
            signals = default_signals();
        } else {
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            anyhow::ensure!(
                before_len == signals.len(),
                "Signals contained duplicate elements"
            );
            // Whether each signal may be trapped is decided at install.
            anyhow::ensure!(
                signals.iter().all(|s| *s > 0),
                "Signal numbers must be positive: {signals:?}"
            );
        }

        Ok(Self {
            destination,
            max_dump_bytes,
            signals,
            chain_previous,
            rethrow_after_capture,
            capture_timeout,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            max_threads: DEFAULT_MAX_THREADS,
            stack_capture_bytes: DEFAULT_STACK_CAPTURE_BYTES,
            alt_stack_size: None,
            suspend_signal: None,
        })
    }

    /// Directory destination with every other setting at its default.
    pub fn with_directory(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::new(
            Destination::Directory(dir.into()),
            DEFAULT_MAX_DUMP_BYTES,
            vec![],
            true,
            true,
            DEFAULT_CAPTURE_TIMEOUT,
        )
    }

    /// Builds a configuration from `CRASHDUMP_*` environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        let dir = std::env::var_os(ENV_DUMP_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DUMP_DIR));
        let max_dump_bytes = env_parse(ENV_MAX_BYTES)?.unwrap_or(DEFAULT_MAX_DUMP_BYTES);
        let timeout = env_parse::<u64>(ENV_TIMEOUT_MS)?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CAPTURE_TIMEOUT);
        let chain_previous = env_bool(ENV_CHAIN_PREVIOUS)?.unwrap_or(true);
        let rethrow = env_bool(ENV_RETHROW)?.unwrap_or(true);

        let mut config = Self::new(
            Destination::Directory(dir),
            max_dump_bytes,
            vec![],
            chain_previous,
            rethrow,
            timeout,
        )?;
        if let Some(depth) = env_parse(ENV_MAX_DEPTH)? {
            config.set_max_stack_depth(depth)?;
        }
        Ok(config)
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn max_dump_bytes(&self) -> usize {
        self.max_dump_bytes
    }

    pub fn signals(&self) -> &Vec<i32> {
        &self.signals
    }

    pub fn chain_previous(&self) -> bool {
        self.chain_previous
    }

    pub fn rethrow_after_capture(&self) -> bool {
        self.rethrow_after_capture
    }

    pub fn capture_timeout(&self) -> Duration {
        self.capture_timeout
    }

    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn stack_capture_bytes(&self) -> usize {
        self.stack_capture_bytes
    }

    /// Requested alternate stack size; the installer picks a default when unset.
    pub fn alt_stack_size(&self) -> Option<usize> {
        self.alt_stack_size
    }

    pub fn suspend_signal(&self) -> Option<i32> {
        self.suspend_signal
    }

    pub fn set_max_dump_bytes(&mut self, max_dump_bytes: usize) -> anyhow::Result<()> {
        check_max_dump_bytes(max_dump_bytes)?;
        self.max_dump_bytes = max_dump_bytes;
        Ok(())
    }

    pub fn set_max_stack_depth(&mut self, depth: usize) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=4096).contains(&depth),
            "Stack depth must be between 1 and 4096, got {depth}"
        );
        self.max_stack_depth = depth;
        Ok(())
    }

    pub fn set_max_threads(&mut self, max_threads: usize) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=65536).contains(&max_threads),
            "Thread limit must be between 1 and 65536, got {max_threads}"
        );
        self.max_threads = max_threads;
        Ok(())
    }

    pub fn set_stack_capture_bytes(&mut self, bytes: usize) -> anyhow::Result<()> {
        anyhow::ensure!(
            bytes <= 16 * 1024 * 1024,
            "Stack capture is limited to 16 MiB, got {bytes}"
        );
        self.stack_capture_bytes = bytes;
        Ok(())
    }

    pub fn set_alt_stack_size(&mut self, size: usize) -> anyhow::Result<()> {
        anyhow::ensure!(
            size >= libc::SIGSTKSZ,
            "Alternate stack must be at least SIGSTKSZ ({}) bytes, got {size}",
            libc::SIGSTKSZ
        );
        self.alt_stack_size = Some(size);
        Ok(())
    }

    pub fn set_suspend_signal(&mut self, signum: i32) -> anyhow::Result<()> {
        anyhow::ensure!(
            (libc::SIGRTMIN()..=libc::SIGRTMAX()).contains(&signum),
            "Suspend signal {signum} is not a real-time signal"
        );
        anyhow::ensure!(
            !self.signals.contains(&signum),
            "Suspend signal {signum} is also trapped as a crash signal"
        );
        self.suspend_signal = Some(signum);
        Ok(())
    }

    pub(crate) fn capture_limits(&self) -> CaptureLimits {
        CaptureLimits {
            max_threads: self.max_threads,
            max_frames_per_thread: self.max_stack_depth,
            max_modules: DEFAULT_MAX_MODULES,
            max_memory_regions: MAX_MEMORY_REGIONS,
            memory_bytes: self.stack_capture_bytes + IP_REGION_BYTES,
        }
    }
}

fn check_max_dump_bytes(max_dump_bytes: usize) -> anyhow::Result<()> {
    let minimum = minimal_dump_size();
    anyhow::ensure!(
        max_dump_bytes >= minimum,
        "max_dump_bytes ({max_dump_bytes}) cannot hold even a minimal dump ({minimum} bytes)"
    );
    anyhow::ensure!(
        max_dump_bytes <= MAX_DUMP_BYTES_LIMIT,
        "max_dump_bytes ({max_dump_bytes}) exceeds the format limit of {MAX_DUMP_BYTES_LIMIT}"
    );
    Ok(())
}

fn env_parse<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {name}: {value:?}")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Unable to read {name}")),
    }
}

fn env_bool(name: &str) -> anyhow::Result<Option<bool>> {
    let Ok(value) = std::env::var(name) else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => anyhow::bail!("Invalid boolean for {name}: {other:?}"),
    }
}
