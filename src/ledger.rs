//! File-backed retry ledger, one file per check.
//!
//! The ledger remembers the last few verdicts so a sub-service with a retry
//! budget can flap briefly without being failed on the wire. Files live under
//! `track_directory` and are wiped on startup; the history is advisory, not
//! durable state.

use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};
use tracing::error;

use crate::error::LedgerError;
use crate::verdict::Verdict;

/// Maximum entries retained per check.
pub const MAX_LEDGER_ENTRIES: usize = 10;

/// One recorded check run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Epoch seconds of the run.
    pub timestamp: f64,
    /// Verdict the run produced.
    pub verdict: Verdict,
}

/// Newest-first ring of recent verdicts for one check.
#[derive(Debug)]
pub struct RetryLedger {
    path: PathBuf,
    entries: Vec<LedgerEntry>,
}

impl RetryLedger {
    /// Loads the ledger for `check_id`. A missing file is an empty ledger;
    /// an unreadable one is logged and treated as empty.
    pub fn load(track_directory: &Path, check_id: &str) -> Self {
        let path = track_directory.join(check_id);
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                error!("discarding unparsable ledger {}: {err}", path.display());
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self { path, entries }
    }

    /// Prepends an entry, trims to [`MAX_LEDGER_ENTRIES`], and atomically
    /// replaces the backing file via a temp-file rename.
    pub fn record(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        self.entries.insert(0, entry);
        self.entries.truncate(MAX_LEDGER_ENTRIES);

        let data = serde_json::to_string(&self.entries)?;
        let tmp_path = {
            let mut os: OsString = self.path.clone().into_os_string();
            os.push(".tmp");
            PathBuf::from(os)
        };
        fs::write(&tmp_path, data)
            .map_err(|source| LedgerError::WriteError { source })?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|source| LedgerError::WriteError { source })?;
        Ok(())
    }

    /// True when the `retries` most recent entries are all BAD. Fewer
    /// recorded runs than `retries` never hard-fails.
    pub fn is_hard_failing(&self, retries: u32) -> bool {
        let retries = retries.max(1) as usize;
        self.entries.len() >= retries
            && self.entries[..retries]
                .iter()
                .all(|entry| entry.verdict == Verdict::Bad)
    }

    /// Recorded entries, newest first.
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }
}

/// Recreates `track_directory` empty. Stale ledgers from a previous run must
/// not count toward a retry budget.
pub fn reset_track_directory(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(timestamp: f64, verdict: Verdict) -> LedgerEntry {
        LedgerEntry { timestamp, verdict }
    }

    #[test]
    fn missing_file_is_an_empty_ledger() {
        let dir = tempdir().unwrap();
        let ledger = RetryLedger::load(dir.path(), "httpok-www");
        assert!(ledger.entries().is_empty());
    }

    #[test]
    fn entries_are_newest_first_and_capped() {
        let dir = tempdir().unwrap();
        let mut ledger = RetryLedger::load(dir.path(), "httpok-www");

        for i in 0..15 {
            ledger.record(entry(i as f64, Verdict::Ok)).unwrap();
        }

        assert_eq!(ledger.entries().len(), MAX_LEDGER_ENTRIES);
        assert_eq!(ledger.entries()[0].timestamp, 14.0);
        assert_eq!(ledger.entries()[9].timestamp, 5.0);
    }

    #[test]
    fn reload_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let mut ledger = RetryLedger::load(dir.path(), "httpok-www");
        ledger.record(entry(1.0, Verdict::Bad)).unwrap();
        ledger.record(entry(2.0, Verdict::Warn)).unwrap();

        let reloaded = RetryLedger::load(dir.path(), "httpok-www");
        assert_eq!(reloaded.entries(), ledger.entries());
        assert_eq!(reloaded.entries()[0].verdict, Verdict::Warn);
    }

    #[test]
    fn unparsable_ledger_is_discarded() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("httpok-www"), "not json").unwrap();
        let ledger = RetryLedger::load(dir.path(), "httpok-www");
        assert!(ledger.entries().is_empty());
    }

    #[test]
    fn hard_failing_requires_consecutive_bad_runs() {
        let dir = tempdir().unwrap();
        let mut ledger = RetryLedger::load(dir.path(), "httpok-www");

        ledger.record(entry(1.0, Verdict::Bad)).unwrap();
        assert!(!ledger.is_hard_failing(3));
        ledger.record(entry(2.0, Verdict::Bad)).unwrap();
        assert!(!ledger.is_hard_failing(3));
        ledger.record(entry(3.0, Verdict::Bad)).unwrap();
        assert!(ledger.is_hard_failing(3));

        ledger.record(entry(4.0, Verdict::Ok)).unwrap();
        assert!(!ledger.is_hard_failing(3));
    }

    #[test]
    fn hard_failing_with_single_retry() {
        let dir = tempdir().unwrap();
        let mut ledger = RetryLedger::load(dir.path(), "www");
        assert!(!ledger.is_hard_failing(1));
        ledger.record(entry(1.0, Verdict::Bad)).unwrap();
        assert!(ledger.is_hard_failing(1));
    }

    #[test]
    fn reset_wipes_previous_ledgers() {
        let dir = tempdir().unwrap();
        let track = dir.path().join("track");
        fs::create_dir_all(&track).unwrap();
        fs::write(track.join("stale"), "[]").unwrap();

        reset_track_directory(&track).unwrap();
        assert!(track.exists());
        assert!(!track.join("stale").exists());
    }
}
