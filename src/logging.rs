use std::error::Error;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, TimeZone};
use tracing_subscriber::EnvFilter;

use crate::core::message::Turn;

/// Install the stderr subscriber. `RUST_LOG` overrides the default `warn`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Appends conversation turns to a plain-text transcript.
pub struct TranscriptLog {
    file_path: Option<PathBuf>,
}

impl TranscriptLog {
    pub fn new(log_file: Option<PathBuf>) -> Result<Self, Box<dyn Error>> {
        if let Some(path) = &log_file {
            Self::test_file_access(path)?;
        }
        Ok(Self {
            file_path: log_file,
        })
    }

    pub fn is_active(&self) -> bool {
        self.file_path.is_some()
    }

    pub fn log_turn(&self, speaker: &str, turn: &Turn) -> Result<(), Box<dyn Error>> {
        let stamp = Local
            .timestamp_millis_opt(turn.timestamp_ms)
            .single()
            .map(|time| time.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        self.log_message(&format!("[{stamp}] {speaker}: {}", turn.content))
    }

    pub fn log_message(&self, content: &str) -> Result<(), Box<dyn Error>> {
        let Some(file_path) = &self.file_path else {
            return Ok(());
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let mut writer = BufWriter::new(file);

        for line in content.lines() {
            writeln!(writer, "{line}")?;
        }
        // Blank line between entries.
        writeln!(writer)?;

        writer.flush()?;
        Ok(())
    }

    fn test_file_access(path: &Path) -> Result<(), Box<dyn Error>> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Role;
    use std::fs;
    use tempfile::TempDir;

    fn turn(role: Role, content: &str) -> Turn {
        Turn {
            id: "1".to_string(),
            persona_id: "career-mentor".to_string(),
            role,
            content: content.to_string(),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn inactive_log_writes_nothing() {
        let log = TranscriptLog::new(None).unwrap();
        assert!(!log.is_active());
        log.log_message("ignored").unwrap();
    }

    #[test]
    fn turns_are_appended_with_spacing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chat.log");
        let log = TranscriptLog::new(Some(path.clone())).unwrap();
        assert!(log.is_active());

        log.log_turn("You", &turn(Role::User, "Hello")).unwrap();
        log.log_turn("Coach", &turn(Role::Assistant, "Line one\nLine two")).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("] You: Hello"));
        assert_eq!(lines[1], "");
        assert!(lines[2].ends_with("] Coach: Line one"));
        assert_eq!(lines[3], "Line two");
        assert_eq!(lines[4], "");
    }

    #[test]
    fn unwritable_path_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("chat.log");
        assert!(TranscriptLog::new(Some(path)).is_err());
    }
}
