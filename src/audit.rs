use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One tool-usage record. Side-effect only: writing these must never
/// fail a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AuditRecord {
    pub(crate) ts_utc: String,
    pub(crate) username: String,
    pub(crate) tool_id: String,
    pub(crate) source: String,
    #[serde(rename = "type")]
    pub(crate) kind: String,
}

pub(crate) fn append_audit_jsonl(
    log_dir: &Path,
    record: &AuditRecord,
) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(log_dir)?;
    let date_str = Utc::now().format("%Y-%m-%d");
    let filename = format!("tools-{}.jsonl", date_str);
    let path = log_dir.join(filename);
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    let json = serde_json::to_string(record)?;
    writeln!(file, "{}", json)?;
    Ok(())
}

/// Most recent records, newest last, scanning at most the last week of
/// files. Unparseable lines are skipped.
pub(crate) fn load_recent_audit(log_dir: &Path, limit: usize) -> Vec<AuditRecord> {
    let mut files: Vec<PathBuf> = match fs::read_dir(log_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("tools-") && n.ends_with(".jsonl"))
                    .unwrap_or(false)
            })
            .collect(),
        Err(_) => return Vec::new(),
    };
    files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    files.truncate(7);
    files.reverse();

    let mut collected = Vec::new();
    for path in &files {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let reader = BufReader::new(file);
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => continue,
            };
            let record: AuditRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(_) => continue,
            };
            collected.push(record);
        }
    }
    if collected.len() > limit {
        collected.drain(..collected.len() - limit);
    }
    collected
}
