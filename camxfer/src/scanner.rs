//! Enumerates candidate files in a source directory, filtered by glob
//! pattern and a lexicographic `start_after` marker.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Scanner-side configuration (see `SenderConfig` for the full sender option
/// set; this is the subset the scanner itself needs).
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub src_dir: PathBuf,
    pub pattern: globset::GlobMatcher,
    pub start_after: Option<String>,
}

impl ScannerConfig {
    pub fn new(src_dir: PathBuf, pattern: &str, start_after: Option<String>) -> Result<Self> {
        let glob = globset::GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid glob pattern: {pattern}"))?;
        Ok(Self {
            src_dir,
            pattern: glob.compile_matcher(),
            start_after,
        })
    }
}

/// Tracks which names have already been claimed (in flight or completed) so
/// a single scanner run never dispatches the same name twice.
#[derive(Debug, Default)]
pub struct Scanner {
    in_flight: HashSet<String>,
    completed: HashSet<String>,
    /// Highest name skipped by the start-after filter so far; the filter is
    /// monotone even if `start_after` itself is later lowered by mistake.
    high_water_mark: Option<String>,
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_completed(&mut self, name: &str) {
        self.in_flight.remove(name);
        self.completed.insert(name.to_string());
    }

    pub fn mark_failed_terminal(&mut self, name: &str) {
        // A terminal failure still removes the name from in-flight so the
        // scanner does not wait on it forever; it is not retried within the
        // run (the operator sees it in the summary's per_file_errors).
        self.in_flight.remove(name);
        self.completed.insert(name.to_string());
    }

    /// List the directory once, apply the pattern and start-after filters,
    /// and return names not already in flight or completed, sorted
    /// ascending. Marks the returned names as in flight.
    pub async fn poll(&mut self, config: &ScannerConfig) -> Result<Vec<String>> {
        let mut names = list_dir_names(&config.src_dir).await?;
        names.sort();
        let mut candidates = Vec::new();
        for name in names {
            if !config.pattern.is_match(&name) {
                continue;
            }
            if let Some(marker) = &config.start_after {
                if name.as_str() <= marker.as_str() {
                    continue;
                }
            }
            if self.in_flight.contains(&name) || self.completed.contains(&name) {
                continue;
            }
            candidates.push(name);
        }
        for name in &candidates {
            self.in_flight.insert(name.clone());
        }
        Ok(candidates)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }
}

async fn list_dir_names(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to open source directory {dir:?}"))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed reading source directory {dir:?}"))?
    {
        if let Ok(file_type) = entry.file_type().await {
            if !file_type.is_file() {
                continue;
            }
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Delete stale `.part` files older than `older_than` in `dir`. Never
/// touches a name currently tracked as in flight by `scanner`.
pub async fn cleanup_stale_part_files(
    dir: &Path,
    scanner: &Scanner,
    older_than: std::time::Duration,
) -> Result<usize> {
    let mut removed = 0usize;
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to open source directory {dir:?}"))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed reading source directory {dir:?}"))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.ends_with(".part") || scanner.in_flight.contains(name) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| mtime.elapsed().ok());
        if age.is_some_and(|age| age > older_than) {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_applies_pattern_and_start_after() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a_001.jpg", "a_002.jpg", "a_003.txt", "a_004.jpg"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }
        let config =
            ScannerConfig::new(dir.path().to_path_buf(), "*.jpg", Some("a_001.jpg".into()))
                .unwrap();
        let mut scanner = Scanner::new();
        let mut candidates = scanner.poll(&config).await.unwrap();
        candidates.sort();
        assert_eq!(candidates, vec!["a_002.jpg".to_string(), "a_004.jpg".to_string()]);
    }

    #[tokio::test]
    async fn poll_never_returns_an_in_flight_or_completed_name_twice() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jpg"), b"x").await.unwrap();
        let config = ScannerConfig::new(dir.path().to_path_buf(), "*.jpg", None).unwrap();
        let mut scanner = Scanner::new();
        let first = scanner.poll(&config).await.unwrap();
        assert_eq!(first, vec!["a.jpg".to_string()]);
        let second = scanner.poll(&config).await.unwrap();
        assert!(second.is_empty());
        scanner.mark_completed("a.jpg");
        let third = scanner.poll(&config).await.unwrap();
        assert!(third.is_empty());
    }
}
