//! Translate a selection + duration window into generator arguments.
//!
//! Flag mapping:
//!
//! ```text
//!   albums  → -l <path>
//!   artists → -r <path>
//!   songs   → -s <path> [-m <count>]
//!   genres  → -g <path>
//!   always  → -d <min> -u <max>
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::selection::{Category, DurationRange, Selection, ValidationError};

/// Arguments for one generator run.  Built once, moved into the process
/// runner, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommand {
    args: Vec<String>,
}

impl RunCommand {
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn into_args(self) -> Vec<String> {
        self.args
    }

    /// The category flag carried by this command, if any.
    pub fn category_flag(&self) -> Option<&str> {
        self.args
            .iter()
            .map(String::as_str)
            .find(|arg| CATEGORY_FLAGS.contains(arg))
    }
}

const CATEGORY_FLAGS: [&str; 4] = ["-l", "-r", "-s", "-g"];

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

/// Build the generator arguments.  Pure; validation errors leave nothing
/// behind.
pub fn build(selection: &Selection, duration: &DurationRange) -> Result<RunCommand, ValidationError> {
    let category = selection.category()?;
    duration.validate()?;

    let mut args: Vec<String> = Vec::with_capacity(8);
    match category {
        Some(Category::Albums(path)) => push_flag(&mut args, "-l", path),
        Some(Category::Artists(path)) => push_flag(&mut args, "-r", path),
        Some(Category::Songs { path, max_count }) => {
            push_flag(&mut args, "-s", path);
            if let Some(count) = max_count {
                push_flag(&mut args, "-m", count.to_string());
            }
        }
        Some(Category::Genres(path)) => push_flag(&mut args, "-g", path),
        None => warn!("no input category selected, generator runs on duration only"),
    }

    push_flag(&mut args, "-d", duration.minimum.to_string());
    push_flag(&mut args, "-u", duration.maximum.to_string());

    Ok(RunCommand { args })
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: String) {
    args.push(flag.to_string());
    args.push(value);
}
