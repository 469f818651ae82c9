//! Durable commit-decision log.
//!
//! One JSON record per decided transaction, written atomically (temp file
//! plus rename) before phase 2 starts. Recovery reads the directory: a
//! record present means "commit", absence means "roll back".

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

use super::Xid;

/// A persisted commit decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DecisionRecord {
    xid: Xid,
    decided_at: DateTime<Utc>,
}

/// File-backed decision log.
pub struct TxLog {
    dir: PathBuf,
}

impl TxLog {
    /// Open (and create if needed) the log directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, xid: &Xid) -> PathBuf {
        self.dir.join(format!("{}.json", xid))
    }

    /// Persist the commit decision for `xid`.
    pub fn record(&self, xid: &Xid) -> Result<()> {
        let record = DecisionRecord {
            xid: xid.clone(),
            decided_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&record)?;

        // Atomic write: temp file, then rename.
        let path = self.record_path(xid);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Whether a commit decision is recorded for `xid`.
    pub fn contains(&self, xid: &Xid) -> bool {
        self.record_path(xid).exists()
    }

    /// Remove the decision record for `xid`, if present.
    pub fn clear(&self, xid: &Xid) -> Result<()> {
        let path = self.record_path(xid);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All recorded commit decisions.
    ///
    /// Unparseable files are skipped with a warning rather than failing the
    /// sweep; a half-written temp file must never block recovery.
    pub fn list(&self) -> Result<Vec<Xid>> {
        let mut xids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<DecisionRecord>(&content) {
                Ok(record) => xids.push(record.xid),
                Err(e) => warn!("skipping unreadable decision record {:?}: {}", path, e),
            }
        }
        xids.sort();
        Ok(xids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_contains_clear() {
        let dir = tempfile::tempdir().unwrap();
        let log = TxLog::open(dir.path()).unwrap();
        let xid = Xid::generate();

        assert!(!log.contains(&xid));
        log.record(&xid).unwrap();
        assert!(log.contains(&xid));
        assert_eq!(log.list().unwrap(), vec![xid.clone()]);

        log.clear(&xid).unwrap();
        assert!(!log.contains(&xid));
        // Clearing twice is fine.
        log.clear(&xid).unwrap();
    }

    #[test]
    fn test_list_survives_garbage_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = TxLog::open(dir.path()).unwrap();
        let xid = Xid::generate();
        log.record(&xid).unwrap();

        std::fs::write(dir.path().join("junk.json"), "not json").unwrap();
        std::fs::write(dir.path().join("partial.tmp"), "{").unwrap();

        assert_eq!(log.list().unwrap(), vec![xid]);
    }

    #[test]
    fn test_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let xid = Xid::generate();
        {
            let log = TxLog::open(dir.path()).unwrap();
            log.record(&xid).unwrap();
        }
        let reopened = TxLog::open(dir.path()).unwrap();
        assert!(reopened.contains(&xid));
    }
}
