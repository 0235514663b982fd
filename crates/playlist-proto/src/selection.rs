//! User input for a run: which input category to generate from, and the
//! duration window the playlist has to fit in.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Problems with user input.  Always reported before anything is spawned, and
/// always recoverable by correcting the input and submitting again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("You can't fill more than 1 value, you filled: {count}")]
    TooManySelected { count: usize },
    #[error("{field} must be a whole number, got {value:?}")]
    NotANumber { field: &'static str, value: String },
    #[error("minimum duration {minimum} is greater than maximum duration {maximum}")]
    InvertedRange { minimum: u32, maximum: u32 },
    #[error("{field} has a count but no path")]
    MissingPath { field: &'static str },
}

/// The four input text fields.  Blank fields count as not filled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    #[serde(default)]
    pub albums: Option<String>,
    #[serde(default)]
    pub artists: Option<String>,
    /// `path` or `path,count`.
    #[serde(default)]
    pub songs: Option<String>,
    #[serde(default)]
    pub genres: Option<String>,
}

/// A validated selection: exactly one filled input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    Albums(String),
    Artists(String),
    Songs { path: String, max_count: Option<u32> },
    Genres(String),
}

impl Category {
    pub fn name(&self) -> &'static str {
        match self {
            Category::Albums(_) => "albums",
            Category::Artists(_) => "artists",
            Category::Songs { .. } => "songs",
            Category::Genres(_) => "genres",
        }
    }
}

fn filled(field: &Option<String>) -> Option<&str> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

impl Selection {
    pub fn albums(path: impl Into<String>) -> Self {
        Self {
            albums: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn artists(path: impl Into<String>) -> Self {
        Self {
            artists: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn songs(path: impl Into<String>) -> Self {
        Self {
            songs: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn genres(path: impl Into<String>) -> Self {
        Self {
            genres: Some(path.into()),
            ..Self::default()
        }
    }

    /// Number of non-blank fields.
    pub fn filled_count(&self) -> usize {
        [&self.albums, &self.artists, &self.songs, &self.genres]
            .into_iter()
            .filter(|field| filled(field).is_some())
            .count()
    }

    /// Validate cardinality and resolve the single filled field.
    ///
    /// `Ok(None)` means nothing was filled in.
    pub fn category(&self) -> Result<Option<Category>, ValidationError> {
        let count = self.filled_count();
        if count > 1 {
            return Err(ValidationError::TooManySelected { count });
        }

        if let Some(path) = filled(&self.albums) {
            return Ok(Some(Category::Albums(path.to_string())));
        }
        if let Some(path) = filled(&self.artists) {
            return Ok(Some(Category::Artists(path.to_string())));
        }
        if let Some(songs) = filled(&self.songs) {
            return parse_songs(songs).map(Some);
        }
        if let Some(path) = filled(&self.genres) {
            return Ok(Some(Category::Genres(path.to_string())));
        }
        Ok(None)
    }
}

fn parse_songs(value: &str) -> Result<Category, ValidationError> {
    let Some((path, count)) = value.split_once(',') else {
        return Ok(Category::Songs {
            path: value.to_string(),
            max_count: None,
        });
    };

    let path = path.trim();
    if path.is_empty() {
        return Err(ValidationError::MissingPath { field: "songs" });
    }

    let count = count.trim();
    let max_count = if count.is_empty() {
        None
    } else {
        Some(count.parse::<u32>().map_err(|_| ValidationError::NotANumber {
            field: "songs count",
            value: count.to_string(),
        })?)
    };

    Ok(Category::Songs {
        path: path.to_string(),
        max_count,
    })
}

/// Playlist length bounds, in minutes (the generator multiplies by 60).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationRange {
    pub minimum: u32,
    pub maximum: u32,
}

impl DurationRange {
    pub fn new(minimum: u32, maximum: u32) -> Result<Self, ValidationError> {
        let range = Self { minimum, maximum };
        range.validate()?;
        Ok(range)
    }

    /// Parse the two text fields of the form.
    pub fn parse(minimum: &str, maximum: &str) -> Result<Self, ValidationError> {
        let minimum = parse_bound("minimum duration", minimum)?;
        let maximum = parse_bound("maximum duration", maximum)?;
        Self::new(minimum, maximum)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.minimum > self.maximum {
            return Err(ValidationError::InvertedRange {
                minimum: self.minimum,
                maximum: self.maximum,
            });
        }
        Ok(())
    }
}

fn parse_bound(field: &'static str, value: &str) -> Result<u32, ValidationError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ValidationError::NotANumber {
            field,
            value: value.to_string(),
        })
}

impl fmt::Display for DurationRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.minimum, self.maximum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_fields_are_not_counted() {
        let selection = Selection {
            albums: Some("   ".to_string()),
            artists: Some(String::new()),
            songs: Some("songs.csv".to_string()),
            genres: None,
        };
        assert_eq!(selection.filled_count(), 1);
        assert_eq!(
            selection.category().unwrap(),
            Some(Category::Songs {
                path: "songs.csv".to_string(),
                max_count: None
            })
        );
    }

    #[test]
    fn test_two_fields_is_a_validation_error() {
        let selection = Selection {
            albums: Some("albums.txt".to_string()),
            genres: Some("genres.json".to_string()),
            ..Selection::default()
        };
        let err = selection.category().unwrap_err();
        assert_eq!(err, ValidationError::TooManySelected { count: 2 });
        assert_eq!(
            err.to_string(),
            "You can't fill more than 1 value, you filled: 2"
        );
    }

    #[test]
    fn test_empty_selection_has_no_category() {
        assert_eq!(Selection::default().category().unwrap(), None);
    }

    #[test]
    fn test_songs_with_count() {
        assert_eq!(
            Selection::songs("a.csv, 5").category().unwrap(),
            Some(Category::Songs {
                path: "a.csv".to_string(),
                max_count: Some(5)
            })
        );
        assert_eq!(
            Selection::songs("a.csv,").category().unwrap(),
            Some(Category::Songs {
                path: "a.csv".to_string(),
                max_count: None
            })
        );
    }

    #[test]
    fn test_songs_bad_count() {
        assert_eq!(
            Selection::songs("a.csv,five").category().unwrap_err(),
            ValidationError::NotANumber {
                field: "songs count",
                value: "five".to_string()
            }
        );
        assert_eq!(
            Selection::songs(",5").category().unwrap_err(),
            ValidationError::MissingPath { field: "songs" }
        );
    }

    #[test]
    fn test_duration_parse() {
        assert_eq!(
            DurationRange::parse(" 30", "120 ").unwrap(),
            DurationRange {
                minimum: 30,
                maximum: 120
            }
        );
        assert!(matches!(
            DurationRange::parse("thirty", "120"),
            Err(ValidationError::NotANumber {
                field: "minimum duration",
                ..
            })
        ));
        assert!(matches!(
            DurationRange::parse("30", "-1"),
            Err(ValidationError::NotANumber {
                field: "maximum duration",
                ..
            })
        ));
    }

    #[test]
    fn test_inverted_range_rejected() {
        assert_eq!(
            DurationRange::parse("120", "30").unwrap_err(),
            ValidationError::InvertedRange {
                minimum: 120,
                maximum: 30
            }
        );
        assert!(DurationRange::new(45, 45).is_ok());
    }

    #[test]
    fn test_selection_json_fields_default() {
        let selection: Selection = serde_json::from_str(r#"{"genres":"g.json"}"#).unwrap();
        assert_eq!(selection, Selection::genres("g.json"));
    }
}
