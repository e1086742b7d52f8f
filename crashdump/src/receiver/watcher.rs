// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::dump::{parse_dump, read_dump_file, ParsedDump};
use crate::shared::constants::DUMP_EXTENSION;
use anyhow::Context;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Completed dumps end in `.dmp`; `.dmp.tmp` files are still being written or were abandoned.
pub fn is_complete_dump(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == DUMP_EXTENSION)
}

/// Discovers dumps that appear in a directory and validates them.
///
/// Each file is handed out once. Files that fail validation are reported once and then
/// skipped while they stay in the directory. A path is forgotten once its file disappears,
/// so a dump written again under the same name is handed out again.
#[derive(Debug)]
pub struct DumpWatcher {
    dir: PathBuf,
    poll_interval: Duration,
    seen: HashSet<PathBuf>,
}

impl DumpWatcher {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
            seen: HashSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stops handing out `path`, or hands it out again if it reappears.
    pub fn forget(&mut self, path: &Path) {
        self.seen.remove(path);
    }

    /// Drops every remembered path that is no longer listed and returns the new ones sorted.
    fn pending(&mut self, listed: HashSet<PathBuf>) -> Vec<PathBuf> {
        self.seen.retain(|path| listed.contains(path));
        let mut paths: Vec<_> = listed
            .into_iter()
            .filter(|path| !self.seen.contains(path))
            .collect();
        paths.sort();
        paths
    }

    fn accept(
        &mut self,
        path: PathBuf,
        parsed: anyhow::Result<ParsedDump>,
    ) -> Option<(PathBuf, ParsedDump)> {
        self.seen.insert(path.clone());
        match parsed {
            Ok(dump) => {
                tracing::debug!(path = %path.display(), "Found dump");
                Some((path, dump))
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "Skipping invalid dump: {e:#}");
                None
            }
        }
    }

    /// One synchronous pass over the directory, returning the new valid dumps sorted by path.
    pub fn scan_once(&mut self) -> anyhow::Result<Vec<(PathBuf, ParsedDump)>> {
        let mut listed = HashSet::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if is_complete_dump(&path) {
                listed.insert(path);
            }
        }
        Ok(self
            .pending(listed)
            .into_iter()
            .filter_map(|path| {
                let parsed = read_dump_file(&path);
                self.accept(path, parsed)
            })
            .collect())
    }

    /// The asynchronous form of [`DumpWatcher::scan_once`].
    pub async fn scan(&mut self) -> anyhow::Result<Vec<(PathBuf, ParsedDump)>> {
        let mut listed = HashSet::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list {}", self.dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_complete_dump(&path) {
                listed.insert(path);
            }
        }
        let paths = self.pending(listed);
        let mut found = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = match tokio::fs::read(&path).await {
                Ok(bytes) => parse_dump(&bytes)
                    .with_context(|| format!("Invalid dump {}", path.display())),
                Err(e) => Err(anyhow::Error::new(e)
                    .context(format!("Failed to read {}", path.display()))),
            };
            found.extend(self.accept(path, parsed));
        }
        Ok(found)
    }

    /// Polls the directory and hands every new valid dump to `consumer` until `stop`
    /// completes or the consumer fails.
    pub async fn run<F, S>(&mut self, mut consumer: F, stop: S) -> anyhow::Result<()>
    where
        F: FnMut(&Path, ParsedDump) -> anyhow::Result<()>,
        S: Future<Output = ()>,
    {
        tokio::pin!(stop);
        tracing::info!(dir = %self.dir.display(), "Watching for dumps");
        loop {
            for (path, dump) in self.scan().await? {
                consumer(&path, dump)?;
            }
            tokio::select! {
                _ = &mut stop => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::serialize_into;
    use crate::dump::test_utils::sample_record;

    fn sample_bytes() -> Vec<u8> {
        let mut out = Vec::new();
        serialize_into(&sample_record(), &mut out, 1 << 20).unwrap();
        out
    }

    #[test]
    fn test_is_complete_dump() {
        assert!(is_complete_dump(Path::new("/d/abc-1.dmp")));
        assert!(!is_complete_dump(Path::new("/d/abc-1.dmp.tmp")));
        assert!(!is_complete_dump(Path::new("/d/notes.txt")));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_scan_once_hands_out_each_valid_dump_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a-1.dmp"), sample_bytes()).unwrap();
        std::fs::write(dir.path().join("a-2.dmp.tmp"), sample_bytes()).unwrap();
        std::fs::write(dir.path().join("a-3.dmp"), b"garbage").unwrap();

        let mut watcher = DumpWatcher::new(dir.path(), Duration::from_millis(10));
        let found = watcher.scan_once().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, dir.path().join("a-1.dmp"));
        assert_eq!(found[0].1.context.tid, 101);
        assert!(watcher.scan_once().unwrap().is_empty());

        std::fs::write(dir.path().join("a-4.dmp"), sample_bytes()).unwrap();
        let found = watcher.scan_once().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, dir.path().join("a-4.dmp"));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_scan_forgets_removed_files() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("d-1.dmp");
        let invalid = dir.path().join("d-2.dmp");
        std::fs::write(&dump, sample_bytes()).unwrap();
        std::fs::write(&invalid, b"garbage").unwrap();

        let mut watcher = DumpWatcher::new(dir.path(), Duration::from_millis(10));
        assert_eq!(watcher.scan_once().unwrap().len(), 1);
        assert_eq!(watcher.seen.len(), 2);

        std::fs::remove_file(&dump).unwrap();
        std::fs::remove_file(&invalid).unwrap();
        assert!(watcher.scan_once().unwrap().is_empty());
        assert!(watcher.seen.is_empty());

        // The same name published again is a new dump.
        std::fs::write(&dump, sample_bytes()).unwrap();
        let found = watcher.scan_once().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, dump);
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn test_async_scan_forgets_removed_files() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("e-1.dmp");
        std::fs::write(&dump, sample_bytes()).unwrap();

        let mut watcher = DumpWatcher::new(dir.path(), Duration::from_millis(10));
        assert_eq!(watcher.scan().await.unwrap().len(), 1);
        assert!(watcher.scan().await.unwrap().is_empty());
        std::fs::remove_file(&dump).unwrap();
        assert!(watcher.scan().await.unwrap().is_empty());
        assert!(watcher.seen.is_empty());
    }

    #[test]
    fn test_scan_once_missing_directory() {
        let mut watcher = DumpWatcher::new("/nonexistent/crashdump", Duration::from_millis(10));
        assert!(watcher.scan_once().is_err());
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn test_run_delivers_dumps_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b-1.dmp"), sample_bytes()).unwrap();
        let mut watcher = DumpWatcher::new(dir.path(), Duration::from_millis(5));
        let mut delivered = Vec::new();
        watcher
            .run(
                |path, dump| {
                    delivered.push((path.to_path_buf(), dump.context.signal));
                    Ok(())
                },
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        assert_eq!(delivered, vec![(dir.path().join("b-1.dmp"), libc::SIGSEGV)]);
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn test_run_stops_on_consumer_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c-1.dmp"), sample_bytes()).unwrap();
        let mut watcher = DumpWatcher::new(dir.path(), Duration::from_millis(5));
        let result = watcher
            .run(
                |_, _| anyhow::bail!("upload failed"),
                std::future::pending::<()>(),
            )
            .await;
        assert!(result.is_err());
    }
}
