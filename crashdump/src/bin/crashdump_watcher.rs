// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use anyhow::Context;
use clap::Parser;
use crashdump::receiver::DumpWatcher;
use crashdump::ParsedDump;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Picks up completed crash dumps from a directory and prints a JSON summary of each.
#[derive(Parser, Debug)]
struct Cli {
    /// Directory the crash handler writes dumps to
    dir: PathBuf,
    /// How often to look for new dumps, in milliseconds
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,
    /// Scan the directory once and exit
    #[arg(long)]
    once: bool,
    /// Delete each dump once it has been printed
    #[arg(long)]
    delete: bool,
}

fn emit(path: &Path, dump: ParsedDump, delete: bool) -> anyhow::Result<()> {
    let mut summary = dump.summary();
    summary.file = Some(path.display().to_string());
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &summary)?;
    writeln!(stdout)?;
    stdout.flush()?;
    if delete {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to delete {}", path.display()))?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut watcher = DumpWatcher::new(&cli.dir, Duration::from_millis(cli.poll_ms));
    if cli.once {
        for (path, dump) in watcher.scan_once()? {
            emit(&path, dump, cli.delete)?;
        }
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(watcher.run(
        |path, dump| emit(path, dump, cli.delete),
        async {
            let _ = tokio::signal::ctrl_c().await;
        },
    ))
}
