//! Decides whether a candidate file is fully written, using two
//! independent signals: a lookahead heuristic and size stability.

use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    NotYetLookahead,
    NotStable,
    FileMissing,
}

/// Pure lookahead check: `candidate` is considered closed-by-producer if a
/// later name exists at least `lookahead` positions after it in the sorted
/// directory listing. `listing` must already be sorted ascending and
/// contain `candidate`.
pub fn lookahead_satisfied(listing: &[String], candidate: &str, lookahead: usize) -> bool {
    let Some(pos) = listing.iter().position(|name| name == candidate) else {
        return false;
    };
    listing.len() > pos + lookahead
}

/// Readiness config subset the probe itself needs.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessConfig {
    pub lookahead: usize,
    pub stable_ms: u64,
    pub file_wait_ms: u64,
}

/// Probe one candidate. `listing` is the most recent sorted directory
/// listing from the scanner poll that produced this candidate.
pub async fn probe(
    src_dir: &Path,
    candidate: &str,
    listing: &[String],
    config: &ReadinessConfig,
) -> Outcome {
    if !lookahead_satisfied(listing, candidate, config.lookahead) {
        return Outcome::NotYetLookahead;
    }
    let path = src_dir.join(candidate);
    let Some(first_size) = wait_for_size(&path, config.file_wait_ms).await else {
        return Outcome::FileMissing;
    };
    tokio::time::sleep(Duration::from_millis(config.stable_ms)).await;
    let second_size = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata.len(),
        Err(_) => return Outcome::FileMissing,
    };
    if stable(first_size, second_size) {
        Outcome::Ready
    } else {
        Outcome::NotStable
    }
}

/// Two non-zero, equal size samples indicate the writer has stopped
/// appending.
pub fn stable(first: u64, second: u64) -> bool {
    first == second && first > 0
}

async fn wait_for_size(path: &Path, file_wait_ms: u64) -> Option<u64> {
    if let Ok(metadata) = tokio::fs::metadata(path).await {
        return Some(metadata.len());
    }
    let deadline = tokio::time::Instant::now() + Duration::from_millis(file_wait_ms);
    let retry_interval = Duration::from_millis((file_wait_ms / 4).max(1));
    loop {
        tokio::time::sleep(retry_interval).await;
        if let Ok(metadata) = tokio::fs::metadata(path).await {
            return Some(metadata.len());
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookahead_requires_k_later_names() {
        let listing = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert!(!lookahead_satisfied(&listing, "b", 2));
        assert!(lookahead_satisfied(&listing, "a", 2));
        assert!(!lookahead_satisfied(&listing, "c", 1));
    }

    #[test]
    fn lookahead_of_missing_candidate_is_false() {
        let listing = vec!["a".to_string()];
        assert!(!lookahead_satisfied(&listing, "z", 0));
    }

    #[test]
    fn stable_requires_equal_nonzero_sizes() {
        assert!(stable(10, 10));
        assert!(!stable(0, 0));
        assert!(!stable(10, 11));
    }

    #[tokio::test]
    async fn probe_reports_not_yet_lookahead_when_insufficient_listing() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jpg"), b"12345")
            .await
            .unwrap();
        let listing = vec!["a.jpg".to_string()];
        let config = ReadinessConfig {
            lookahead: 4,
            stable_ms: 1,
            file_wait_ms: 5,
        };
        let outcome = probe(dir.path(), "a.jpg", &listing, &config).await;
        assert_eq!(outcome, Outcome::NotYetLookahead);
    }

    #[tokio::test]
    async fn probe_reports_ready_for_a_stable_file_with_lookahead() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jpg"), b"12345")
            .await
            .unwrap();
        let listing = vec![
            "a.jpg".to_string(),
            "b.jpg".to_string(),
            "c.jpg".to_string(),
            "d.jpg".to_string(),
            "e.jpg".to_string(),
        ];
        let config = ReadinessConfig {
            lookahead: 4,
            stable_ms: 1,
            file_wait_ms: 5,
        };
        let outcome = probe(dir.path(), "a.jpg", &listing, &config).await;
        assert_eq!(outcome, Outcome::Ready);
    }

    #[tokio::test]
    async fn probe_reports_file_missing_when_absent_past_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let listing = vec![
            "a.jpg".to_string(),
            "b.jpg".to_string(),
            "c.jpg".to_string(),
            "d.jpg".to_string(),
            "e.jpg".to_string(),
        ];
        let config = ReadinessConfig {
            lookahead: 4,
            stable_ms: 1,
            file_wait_ms: 5,
        };
        let outcome = probe(dir.path(), "a.jpg", &listing, &config).await;
        assert_eq!(outcome, Outcome::FileMissing);
    }
}
