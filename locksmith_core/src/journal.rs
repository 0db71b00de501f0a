//! Audit journal of provisioning actions.
//!
//! Every action run against a card is appended to a JSONL (JSON Lines) file
//! with file locking. `export_to_csv_and_archive` moves the journal into a
//! CSV file the way an operator would hand it over.

use crate::Result;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// How an action ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Mismatch,
    Failed,
}

/// One journal entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub reader: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_number: Option<u16>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProvisioningEvent {
    pub fn new(reader: impl Into<String>, action: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            reader: reader.into(),
            action: action.into(),
            lock_number: None,
            outcome,
            detail: None,
        }
    }

    pub fn with_lock_number(mut self, lock_number: u16) -> Self {
        self.lock_number = Some(lock_number);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Destination for journal entries
pub trait EventSink {
    fn append(&mut self, event: &ProvisioningEvent) -> Result<()>;
}

/// JSONL journal with file locking
pub struct JournalSink {
    path: PathBuf,
}

impl JournalSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl EventSink for JournalSink {
    fn append(&mut self, event: &ProvisioningEvent) -> Result<()> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(event)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        file.unlock()?;
        tracing::debug!("Journaled {} ({:?})", event.action, event.outcome);
        Ok(())
    }
}

/// Read all events from a journal file. Malformed lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<ProvisioningEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut events = Vec::new();
    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ProvisioningEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!("Skipping journal line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} events from journal", events.len());
    Ok(events)
}

#[derive(Debug, Serialize)]
struct CsvRow {
    id: String,
    at: String,
    reader: String,
    action: String,
    lock_number: Option<u16>,
    outcome: Outcome,
    detail: Option<String>,
}

impl From<&ProvisioningEvent> for CsvRow {
    fn from(event: &ProvisioningEvent) -> Self {
        CsvRow {
            id: event.id.to_string(),
            at: event.at.to_rfc3339(),
            reader: event.reader.clone(),
            action: event.action.clone(),
            lock_number: event.lock_number,
            outcome: event.outcome,
            detail: event.detail.clone(),
        }
    }
}

/// Append journal events to a CSV file, then archive the journal.
///
/// The CSV is synced before the journal is renamed, and the journal is
/// renamed rather than deleted. Returns the number of events exported.
pub fn export_to_csv_and_archive(journal_path: &Path, csv_path: &Path) -> Result<usize> {
    let events = read_events(journal_path)?;
    if events.is_empty() {
        tracing::info!("Journal is empty, nothing to export");
        return Ok(0);
    }

    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;
    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);
    for event in &events {
        writer.serialize(CsvRow::from(event))?;
    }
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    file.sync_all()?;
    tracing::info!("Exported {} events to {:?}", events.len(), csv_path);

    let archived = archive_path(journal_path);
    std::fs::rename(journal_path, &archived)?;
    tracing::info!("Archived journal to {:?}", archived);

    Ok(events.len())
}

fn archive_path(journal_path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let tag = Uuid::new_v4().simple().to_string();
    journal_path.with_extension(format!("{}-{}.processed", stamp, &tag[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(action: &str) -> ProvisioningEvent {
        ProvisioningEvent::new("Sim 0", action, Outcome::Success).with_lock_number(41)
    }

    #[test]
    fn test_append_and_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("journal.jsonl");

        let mut sink = JournalSink::new(&path);
        let first = event("setup write");
        sink.append(&first).unwrap();
        sink.append(&event("check").with_detail("match")).unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], first);
        assert_eq!(events[1].detail.as_deref(), Some("match"));
    }

    #[test]
    fn test_read_missing_journal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let events = read_events(&temp_dir.path().join("none.jsonl")).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("journal.jsonl");

        let mut sink = JournalSink::new(&path);
        sink.append(&event("dump")).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"id\": \"trunc\n").unwrap();
        }
        sink.append(&event("clear")).unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action, "clear");
    }

    #[test]
    fn test_export_and_archive() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal = temp_dir.path().join("journal.jsonl");
        let csv_path = temp_dir.path().join("export").join("journal.csv");

        let mut sink = JournalSink::new(&journal);
        for _ in 0..3 {
            sink.append(&event("setup write")).unwrap();
        }

        assert_eq!(export_to_csv_and_archive(&journal, &csv_path).unwrap(), 3);
        assert!(!journal.exists());

        let contents = std::fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("id,at,reader,action,lock_number,outcome"));
        assert!(lines[1].contains("setup write"));

        // Second export appends without another header
        sink.append(&event("check")).unwrap();
        assert_eq!(export_to_csv_and_archive(&journal, &csv_path).unwrap(), 1);
        let contents = std::fs::read_to_string(&csv_path).unwrap();
        assert_eq!(contents.lines().count(), 5);

        let archived = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "processed"))
            .count();
        assert_eq!(archived, 2);
    }

    #[test]
    fn test_export_empty_journal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal = temp_dir.path().join("journal.jsonl");
        let csv_path = temp_dir.path().join("journal.csv");
        assert_eq!(export_to_csv_and_archive(&journal, &csv_path).unwrap(), 0);
        assert!(!csv_path.exists());
    }
}
