//! Append-only, per-identity journal of executed steps.
//!
//! One file per resolved token identity, named `<identity>.log`, one line
//! per operation record. The file is opened, appended and closed for every
//! single record; durability across concurrent writers relies on OS
//! append-mode atomicity for single writes.

use std::{
    fs::OpenOptions,
    io,
    io::Write,
    path::PathBuf,
};

use chrono::Local;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d.%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Fail,
}

impl Outcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Fail => "FAIL",
        }
    }
}

/// One journaled fact. Immutable once written.
#[derive(Debug)]
pub struct OperationRecord<'a> {
    pub identity: &'a str,
    pub iteration: u64,
    pub operation: &'a str,
    pub outcome: Outcome,
    /// Only steps that produce a data artifact carry a payload.
    pub payload: Option<&'a [u8]>,
}

pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Journal { dir: dir.into() }
    }

    /// Append one record to `<identity>.log`.
    pub fn append(&self, record: &OperationRecord) -> io::Result<()> {
        let path = self.dir.join(format!("{}.log", record.identity));
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        writeln!(file, "{}", format_line(&timestamp, record))
    }
}

fn format_line(timestamp: &str, record: &OperationRecord) -> String {
    let mut line = format!(
        "{timestamp},{},{},{},{}",
        record.identity,
        record.iteration,
        record.operation,
        record.outcome.as_str()
    );
    if let Some(payload) = record.payload {
        line.push(',');
        line.push_str(&hex::encode_upper(payload));
    }
    line
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{Journal, OperationRecord, Outcome, format_line};

    fn record<'a>(outcome: Outcome, payload: Option<&'a [u8]>) -> OperationRecord<'a> {
        OperationRecord {
            identity: "0A1B2C",
            iteration: 3,
            operation: "ENCRYPT",
            outcome,
            payload,
        }
    }

    #[test]
    fn line_without_payload_has_five_fields() {
        let line = format_line("2026-08-07.10:30:00", &record(Outcome::Success, None));
        assert_eq!(line, "2026-08-07.10:30:00,0A1B2C,3,ENCRYPT,SUCCESS");
        assert_eq!(line.split(',').count(), 5);
    }

    #[test]
    fn payload_is_uppercase_hex_in_a_sixth_field() {
        let line = format_line(
            "2026-08-07.10:30:00",
            &record(Outcome::Success, Some(&[0xDE, 0xAD, 0x0F])),
        );
        assert_eq!(line, "2026-08-07.10:30:00,0A1B2C,3,ENCRYPT,SUCCESS,DEAD0F");
    }

    #[test]
    fn failures_render_as_fail() {
        let line = format_line("2026-08-07.10:30:00", &record(Outcome::Fail, None));
        assert!(line.ends_with(",FAIL"));
    }

    #[test]
    fn append_accumulates_lines_per_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = Journal::new(dir.path());
        journal
            .append(&record(Outcome::Success, None))
            .expect("append");
        journal
            .append(&record(Outcome::Fail, None))
            .expect("append");

        let contents =
            fs::read_to_string(dir.path().join("0A1B2C.log")).expect("journal file exists");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("SUCCESS"));
        assert!(lines[1].ends_with("FAIL"));
        // Timestamps keep the YYYY-MM-DD.HH:mm:ss shape.
        let timestamp = lines[0].split(',').next().expect("timestamp field");
        assert_eq!(timestamp.len(), 19);
        assert_eq!(&timestamp[4..5], "-");
        assert_eq!(&timestamp[10..11], ".");
    }
}
