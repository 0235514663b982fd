//! Turning a finished generator run into playlist text.
//!
//! The generator saves its result as a JSON object keyed by song id, with one
//! extra `total_time_in_ms` entry:
//!
//! ```json
//! {
//!   "4uLU6hMCjMI75M1A2tKUQC": {
//!     "name": "Song", "artists": ["Artist"], "link": "https://...", "popularity": 71
//!   },
//!   "total_time_in_ms": 212000
//! }
//! ```

use playlist_proto::config::{ParserConfig, ParserKind};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use crate::process::ProcessOutput;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("playlist parsing is not implemented")]
    NotImplemented,
    #[error("malformed playlist document: {0}")]
    Malformed(String),
    #[error("could not read playlist file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ParseError {
    /// True when parsing is unavailable rather than failed.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ParseError::NotImplemented)
    }
}

pub trait PlaylistParser: Send + Sync + 'static {
    fn parse(&self, output: &ProcessOutput) -> Result<String, ParseError>;
}

/// Stand-in until the generator's output format is settled: every run ends
/// with `NotImplemented`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingParser;

impl PlaylistParser for PendingParser {
    fn parse(&self, _output: &ProcessOutput) -> Result<String, ParseError> {
        Err(ParseError::NotImplemented)
    }
}

/// Reads the generator's playlist JSON, from stdout or from a saved file.
#[derive(Debug, Clone, Default)]
pub struct JsonPlaylistParser {
    playlist_file: Option<PathBuf>,
}

impl JsonPlaylistParser {
    pub fn from_stdout() -> Self {
        Self {
            playlist_file: None,
        }
    }

    pub fn from_file(path: PathBuf) -> Self {
        Self {
            playlist_file: Some(path),
        }
    }

    pub fn render(document: &str) -> Result<String, ParseError> {
        let root: Value = serde_json::from_str(document.trim())
            .map_err(|e| ParseError::Malformed(e.to_string()))?;
        let entries = root
            .as_object()
            .ok_or_else(|| ParseError::Malformed("expected a JSON object".to_string()))?;

        let mut lines = Vec::with_capacity(entries.len());
        let mut total_ms = None;
        for (id, entry) in entries {
            if id == "total_time_in_ms" {
                total_ms = entry.as_u64();
                continue;
            }
            lines.push(render_song(id, entry)?);
        }

        if let Some(ms) = total_ms {
            let secs = ms / 1000;
            lines.push(format!("Total: {}:{:02}", secs / 60, secs % 60));
        }
        Ok(lines.join("\n"))
    }
}

fn render_song(id: &str, entry: &Value) -> Result<String, ParseError> {
    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::Malformed(format!("song {} has no name", id)))?;

    let mut line = name.to_string();
    let artists = artist_names(entry.get("artists"));
    if !artists.is_empty() {
        line.push_str(" - ");
        line.push_str(&artists.join(", "));
    }
    if let Some(link) = entry.get("link").and_then(Value::as_str) {
        line.push(' ');
        line.push_str(link);
    }
    Ok(line)
}

/// Artists show up as a plain string, a list of names, or a list of
/// `{ "name": ... }` objects depending on where the generator got them.
fn artist_names(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(name)) => vec![name.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(name) => Some(name.clone()),
                Value::Object(obj) => obj.get("name").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

impl PlaylistParser for JsonPlaylistParser {
    fn parse(&self, output: &ProcessOutput) -> Result<String, ParseError> {
        match &self.playlist_file {
            Some(path) => {
                let document = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
                    path: path.clone(),
                    source,
                })?;
                Self::render(&document)
            }
            None => Self::render(&output.stdout),
        }
    }
}

pub fn from_config(config: &ParserConfig) -> Arc<dyn PlaylistParser> {
    match config.kind {
        ParserKind::Pending => Arc::new(PendingParser),
        ParserKind::Json => match &config.playlist_file {
            Some(path) => Arc::new(JsonPlaylistParser::from_file(path.clone())),
            None => Arc::new(JsonPlaylistParser::from_stdout()),
        },
    }
}
