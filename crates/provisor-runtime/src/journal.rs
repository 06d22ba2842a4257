//! Append-only JSON-lines log of action results.

use std::io::Write;
use std::path::{Path, PathBuf};

use provisor_core::{ActionResult, Result};
use serde::{Deserialize, Serialize};

/// One line of the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRecord {
    pub run_id: String,
    pub timestamp: String,
    pub result: ActionResult,
}

pub struct RunJournal {
    path: PathBuf,
}

impl RunJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, run_id: &str, result: &ActionResult) -> Result<()> {
        let record = JournalRecord {
            run_id: run_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            result: result.clone(),
        };
        let line = serde_json::to_string(&record)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// All records, oldest first. Unparseable lines are skipped.
    pub fn read_all(&self) -> Result<Vec<JournalRecord>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    pub fn records_for(&self, run_id: &str) -> Result<Vec<JournalRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.run_id == run_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisor_core::{ActionKind, Error, IdempotencyKey};

    fn key(target: &str) -> IdempotencyKey {
        IdempotencyKey {
            kind: ActionKind::InstallPackage,
            target: target.into(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RunJournal::new(dir.path().join("actions.jsonl"));
        assert!(journal.read_all().unwrap().is_empty());

        journal.append("run-1", &ActionResult::skipped(key("docker.io"))).unwrap();
        let failed = ActionResult::failed(
            key("unzip"),
            &Error::StrategiesExhausted {
                action: "install-package:unzip".into(),
                attempts: 2,
            },
            vec![],
        );
        journal.append("run-2", &failed).unwrap();

        let all = journal.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].result, failed);
        assert_eq!(journal.records_for("run-1").unwrap().len(), 1);

        let raw = std::fs::read_to_string(journal.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first["runId"], "run-1");
        assert_eq!(first["result"]["status"], "skipped");
    }
}
