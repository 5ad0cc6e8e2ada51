use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::records::{CreditLedger, DocumentStore, FileStorage, PipelineRecord};

const RECORD_FILE: &str = "pipeline.json";
const EVENTS_FILE: &str = "events.jsonl";
const CREDITS_FILE: &str = "credits.json";
const CREDIT_LOG_FILE: &str = "credits.jsonl";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CreditAccount {
    balance: u32,
}

/// Directory-backed collaborators: one folder per pipeline holding its
/// document, files, credit log and `events.jsonl`.
///
/// A `credits.json` at the root enables balance enforcement; without it
/// deductions are only logged.
#[derive(Debug)]
pub struct LocalWorkspace {
    root: PathBuf,
    credit_lock: Mutex<()>,
}

impl LocalWorkspace {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed creating workspace {}", root.display()))?;
        Ok(Self {
            root,
            credit_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pipeline_dir(&self, pipeline_id: &str) -> Result<PathBuf> {
        let id = pipeline_id.trim();
        if id.is_empty() || id.contains(|ch| ch == '/' || ch == '\\') || id == "." || id == ".." {
            bail!("invalid pipeline id '{pipeline_id}'");
        }
        Ok(self.root.join(id))
    }

    pub fn events_path(&self, pipeline_id: &str) -> Result<PathBuf> {
        Ok(self.pipeline_dir(pipeline_id)?.join(EVENTS_FILE))
    }

    fn file_path(&self, pipeline_id: &str, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        if name.trim().is_empty()
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            bail!("invalid file name '{name}'");
        }
        Ok(self.pipeline_dir(pipeline_id)?.join(relative))
    }

    pub fn credit_balance(&self) -> Result<Option<u32>> {
        let path = self.root.join(CREDITS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let account: CreditAccount = serde_json::from_str(&raw)
            .with_context(|| format!("invalid credit account in {}", path.display()))?;
        Ok(Some(account.balance))
    }

    pub fn set_credit_balance(&self, balance: u32) -> Result<()> {
        write_atomic(
            &self.root.join(CREDITS_FILE),
            serde_json::to_string_pretty(&CreditAccount { balance })?.as_bytes(),
        )
    }
}

impl DocumentStore for LocalWorkspace {
    fn load(&self, pipeline_id: &str) -> Result<Option<PipelineRecord>> {
        let path = self.pipeline_dir(pipeline_id)?.join(RECORD_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let record = serde_json::from_str(&raw)
            .with_context(|| format!("invalid pipeline record {}", path.display()))?;
        Ok(Some(record))
    }

    fn save(&self, record: &PipelineRecord) -> Result<()> {
        let path = self.pipeline_dir(&record.pipeline_id)?.join(RECORD_FILE);
        write_atomic(&path, serde_json::to_string_pretty(record)?.as_bytes())
    }
}

impl FileStorage for LocalWorkspace {
    fn read(&self, pipeline_id: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.file_path(pipeline_id, name)?;
        fs::read(&path).with_context(|| format!("failed reading {}", path.display()))
    }

    fn upload(&self, pipeline_id: &str, name: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        let path = self.file_path(pipeline_id, name)?;
        write_atomic(&path, bytes)?;
        let absolute = fs::canonicalize(&path).unwrap_or(path);
        Ok(reqwest::Url::from_file_path(&absolute)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| absolute.display().to_string()))
    }
}

impl LocalWorkspace {
    /// Apply a signed credit movement and append it to the pipeline's
    /// `credits.jsonl`.
    fn move_credits(&self, pipeline_id: &str, kind: &str, delta: i64, reason: &str) -> Result<()> {
        let _guard = self
            .credit_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("credit ledger lock poisoned"))?;
        let remaining = match self.credit_balance()? {
            Some(balance) => {
                let next = i64::from(balance) + delta;
                if next < 0 {
                    bail!("insufficient credits: balance {balance}, required {}", -delta);
                }
                let next = u32::try_from(next).context("credit balance overflow")?;
                self.set_credit_balance(next)?;
                Some(next)
            }
            None => None,
        };
        let log_path = self.pipeline_dir(pipeline_id)?.join(CREDIT_LOG_FILE);
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "kind": kind,
            "amount": delta.unsigned_abs(),
            "reason": reason,
            "remaining": remaining,
        });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed opening {}", log_path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl CreditLedger for LocalWorkspace {
    fn deduct(&self, pipeline_id: &str, amount: u32, reason: &str) -> Result<()> {
        self.move_credits(pipeline_id, "deduct", -i64::from(amount), reason)
    }

    fn refund(&self, pipeline_id: &str, amount: u32, reason: &str) -> Result<()> {
        self.move_credits(pipeline_id, "refund", i64::from(amount), reason)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).with_context(|| format!("failed writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::LocalWorkspace;
    use crate::records::{CreditLedger, DocumentStore, FileStorage, PipelineRecord};

    #[test]
    fn documents_and_files_round_trip() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let workspace = LocalWorkspace::open(temp.path())?;
        assert!(workspace.load("pipe-1")?.is_none());

        let record = PipelineRecord::new("pipe-1");
        workspace.save(&record)?;
        assert_eq!(workspace.load("pipe-1")?, Some(record));

        let url = workspace.upload("pipe-1", "views/mesh-front.png", b"png", "image/png")?;
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("views/mesh-front.png"));
        assert_eq!(workspace.read("pipe-1", "views/mesh-front.png")?, b"png".to_vec());
        Ok(())
    }

    #[test]
    fn path_escapes_are_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let workspace = LocalWorkspace::open(temp.path())?;
        assert!(workspace.read("pipe-1", "../secret").is_err());
        assert!(workspace.upload("pipe-1", "/etc/passwd", b"x", "text/plain").is_err());
        assert!(workspace.load("../other").is_err());
        Ok(())
    }

    #[test]
    fn ledger_enforces_balance_when_configured() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let workspace = LocalWorkspace::open(temp.path())?;
        workspace.deduct("pipe-1", 10, "unmetered")?;
        assert_eq!(workspace.credit_balance()?, None);

        workspace.set_credit_balance(15)?;
        workspace.deduct("pipe-1", 10, "generation")?;
        assert_eq!(workspace.credit_balance()?, Some(5));
        assert!(workspace.deduct("pipe-1", 10, "generation").is_err());
        assert_eq!(workspace.credit_balance()?, Some(5));

        let log = fs::read_to_string(temp.path().join("pipe-1").join("credits.jsonl"))?;
        assert_eq!(log.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn refund_restores_balance_and_is_logged() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let workspace = LocalWorkspace::open(temp.path())?;
        workspace.set_credit_balance(12)?;
        workspace.deduct("pipe-1", 10, "generation")?;
        workspace.refund("pipe-1", 10, "submission rejected")?;
        assert_eq!(workspace.credit_balance()?, Some(12));

        let log = fs::read_to_string(temp.path().join("pipe-1").join("credits.jsonl"))?;
        let kinds = log
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|entry| entry["kind"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<String>>();
        assert_eq!(kinds, vec!["deduct", "refund"]);
        Ok(())
    }
}
