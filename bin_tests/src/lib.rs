// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Builds the harness binaries with cargo, so that end to end tests crash a real process
//! instead of the test runner.
//!
//! Builds are cached per test binary: several tests asking for the same harness only pay for
//! one `cargo build`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;

use anyhow::Context;
use once_cell::sync::OnceCell;

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum BuildProfile {
    Debug,
    Release,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct ArtifactsBuild {
    /// Name of a `[[bin]]` target in the workspace.
    pub name: String,
    pub build_profile: BuildProfile,
}

impl ArtifactsBuild {
    pub fn bin(name: &str, build_profile: BuildProfile) -> Self {
        Self {
            name: name.to_owned(),
            build_profile,
        }
    }
}

fn cargo_build(c: &ArtifactsBuild) -> anyhow::Result<PathBuf> {
    let mut build_cmd = process::Command::new(env!("CARGO"));
    build_cmd.args(["build", "--message-format=json", "--bin", &c.name]);
    if c.build_profile == BuildProfile::Release {
        build_cmd.arg("--release");
    }
    let output = build_cmd.output().context("Failed to run cargo build")?;
    if !output.status.success() {
        anyhow::bail!(
            "Cargo build failed: status code {:?}\nstderr:\n {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    // One JSON message per line; the executable is on the artifact message of our target.
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        let Ok(message) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if message["reason"] != "compiler-artifact" || message["target"]["name"] != c.name.as_str()
        {
            continue;
        }
        if let Some(executable) = message["executable"].as_str() {
            return Ok(PathBuf::from(executable));
        }
    }
    anyhow::bail!("cargo did not report an executable for {}", c.name)
}

/// Builds each artifact once per process and returns their paths.
pub fn build_artifacts<'b>(
    builds: &[&'b ArtifactsBuild],
) -> anyhow::Result<HashMap<&'b ArtifactsBuild, PathBuf>> {
    static ARTIFACTS: OnceCell<Mutex<HashMap<ArtifactsBuild, PathBuf>>> = OnceCell::new();

    let cache = ARTIFACTS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache
        .lock()
        .map_err(|_| anyhow::anyhow!("artifact cache poisoned"))?;
    let mut res = HashMap::new();
    for &build in builds {
        let path = match cache.get(build) {
            Some(path) => path.clone(),
            None => {
                let path = cargo_build(build)?;
                cache.insert(build.clone(), path.clone());
                path
            }
        };
        res.insert(build, path);
    }
    Ok(res)
}

#[macro_export]
macro_rules! timeit {
    ($op_name:literal, $op:block) => {{
        let start = std::time::Instant::now();
        let res = $op;
        println!(
            concat!($op_name, " took {} ms"),
            start.elapsed().as_secs_f64() * 1000.0
        );
        res
    }};
}
