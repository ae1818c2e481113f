//! Conversation transcript persistence: daily JSONL files under the configured
//! transcript directory.
//!
//! Every dispatched request and its resolution is appended here so the chat
//! surface can restore recent turns and users can export a session.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use aide_llm::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Error,
}

/// One persisted line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn new(role: Role, action: Option<Action>, content: impl Into<String>) -> Self {
        Self {
            role,
            action,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transcript {
    dir: PathBuf,
}

impl Transcript {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<dir>/YYYY-MM-DD.jsonl` for today's local date.
    pub fn path(&self) -> PathBuf {
        let today = Local::now().format("%Y-%m-%d").to_string();
        self.dir.join(format!("{today}.jsonl"))
    }

    /// Append one entry, creating the directory and file as needed.
    pub fn append(&self, entry: &TranscriptEntry) -> Result<()> {
        let path = self.path();
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create transcript dir {}", self.dir.display()))?;

        let line = serde_json::to_string(entry).context("serialize TranscriptEntry")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open transcript file {}", path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Up to `limit` most recent entries from today's file; empty when the
    /// file does not exist yet.
    pub fn load_recent(&self, limit: usize) -> Result<Vec<TranscriptEntry>> {
        let path = self.path();
        if !path.exists() {
            return Ok(vec![]);
        }
        let file = fs::File::open(&path)
            .with_context(|| format!("open transcript file {}", path.display()))?;

        let mut entries = parse_lines(BufReader::new(file));
        if entries.len() > limit {
            let skip = entries.len() - limit;
            entries.drain(..skip);
        }
        Ok(entries)
    }

    pub fn clear(&self) -> Result<()> {
        let path = self.path();
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("remove transcript file {}", path.display()))?;
        }
        Ok(())
    }

    /// Copy today's file to `dest`.
    pub fn export(&self, dest: &Path) -> Result<()> {
        let path = self.path();
        if !path.exists() {
            bail!("no transcript for today ({} does not exist)", path.display());
        }
        fs::copy(&path, dest)
            .with_context(|| format!("copy {} -> {}", path.display(), dest.display()))?;
        Ok(())
    }
}

/// Blank and malformed lines are skipped.
fn parse_lines(reader: impl BufRead) -> Vec<TranscriptEntry> {
    reader
        .lines()
        .filter_map(|line| {
            let line = line.ok()?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            serde_json::from_str(trimmed).ok()
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> (tempfile::TempDir, Transcript) {
        let dir = tempfile::TempDir::new().unwrap();
        let transcript = Transcript::new(dir.path().join("transcript"));
        (dir, transcript)
    }

    #[test]
    fn entry_json_uses_lowercase_role_and_action() {
        let entry = TranscriptEntry::new(Role::User, Some(Action::FixError), "x = y");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"role\":\"user\""));
        assert!(json.contains("\"action\":\"fix_error\""));
        assert!(json.contains("\"timestamp\""));
    }

    #[test]
    fn path_has_date_file_name() {
        let (dir, transcript) = transcript();
        let path = transcript.path();
        let filename = path.file_name().unwrap().to_string_lossy();
        assert!(filename.ends_with(".jsonl"));
        assert_eq!(filename.len(), "YYYY-MM-DD.jsonl".len());
        assert!(path.starts_with(dir.path()));
    }

    #[test]
    fn append_then_load_recent_keeps_order() {
        let (_dir, transcript) = transcript();
        transcript
            .append(&TranscriptEntry::new(Role::User, Some(Action::Explain), "x=1"))
            .unwrap();
        transcript
            .append(&TranscriptEntry::new(Role::Assistant, Some(Action::Explain), "assigns 1"))
            .unwrap();

        let loaded = transcript.load_recent(10).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].role, Role::User);
        assert_eq!(loaded[1].content, "assigns 1");
    }

    #[test]
    fn load_recent_keeps_the_tail() {
        let (_dir, transcript) = transcript();
        for i in 0..5 {
            transcript
                .append(&TranscriptEntry::new(Role::User, None, format!("msg {i}")))
                .unwrap();
        }
        let loaded = transcript.load_recent(2).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content, "msg 3");
        assert_eq!(loaded[1].content, "msg 4");
    }

    #[test]
    fn load_recent_without_file_is_empty() {
        let (_dir, transcript) = transcript();
        assert!(transcript.load_recent(5).unwrap().is_empty());
    }

    #[test]
    fn parse_skips_blank_and_malformed_lines() {
        let valid = serde_json::to_string(&TranscriptEntry::new(Role::Error, None, "boom")).unwrap();
        let raw = format!("{valid}\nnot json at all\n\n{valid}\n");
        let entries = parse_lines(raw.as_bytes());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, Role::Error);
    }

    #[test]
    fn clear_and_export() {
        let (dir, transcript) = transcript();
        let dest = dir.path().join("export.jsonl");
        assert!(transcript.export(&dest).is_err());

        transcript
            .append(&TranscriptEntry::new(Role::User, Some(Action::Chat), "hello"))
            .unwrap();
        transcript.export(&dest).unwrap();
        assert!(fs::read_to_string(&dest).unwrap().contains("hello"));

        transcript.clear().unwrap();
        assert!(!transcript.path().exists());
        transcript.clear().unwrap();
    }
}
