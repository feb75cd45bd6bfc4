//! Event line rendering

use owo_colors::OwoColorize;
use serde::Serialize;
use std::io::{self, Write};
use std::path::Path;
use watcher::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Human,
    Json,
}

/// One reported event
#[derive(Debug, Serialize)]
pub struct EventLine {
    pub kind: &'static str,
    /// Relative path, `.` for the watched root
    pub path: String,
    pub watched: String,
}

impl EventLine {
    pub fn new(watched: &Path, path: Option<&Path>, kind: EventKind) -> Self {
        Self {
            kind: kind.as_str(),
            path: path.map_or_else(|| ".".to_string(), |p| p.display().to_string()),
            watched: watched.display().to_string(),
        }
    }

    pub fn render(&self, format: Format) -> String {
        match format {
            Format::Json => serde_json::to_string(self).unwrap_or_default(),
            Format::Human => {
                let kind = match self.kind {
                    "change" => format!("{:<6}", self.kind).yellow().to_string(),
                    _ => format!("{:<6}", self.kind).cyan().to_string(),
                };
                format!("{} {}", kind, self.path)
            }
        }
    }
}

/// Write one rendered line and flush it so pipes see events as they happen
pub fn write_event(out: &mut impl Write, line: &EventLine, format: Format) -> io::Result<()> {
    writeln!(out, "{}", line.render(format))?;
    out.flush()
}
