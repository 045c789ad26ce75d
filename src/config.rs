use serde::Deserialize;

use crate::error::{Result, TemplateError};

/// Tag delimiters recognised by the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Delimiters {
    pub block_start: String,
    pub block_end: String,
    pub variable_start: String,
    pub variable_end: String,
    pub comment_start: String,
    pub comment_end: String,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            block_start: "{%".to_string(),
            block_end: "%}".to_string(),
            variable_start: "{{".to_string(),
            variable_end: "}}".to_string(),
            comment_start: "{#".to_string(),
            comment_end: "#}".to_string(),
        }
    }
}

/// Environment options.
///
/// Hosts usually deserialize this from their own configuration file:
///
/// ```
/// let config: blockjinja::Config =
///     serde_json::from_str(r#"{ "autoescape": false, "trim_blocks": true }"#).unwrap();
/// assert!(!config.autoescape);
/// assert!(!config.lstrip_blocks);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Escape `& < > " '` in interpolated values unless marked safe.
    pub autoescape: bool,
    /// Fail when an undefined or none value is output.
    pub throw_on_undefined: bool,
    /// Drop the first newline after a block tag.
    pub trim_blocks: bool,
    /// Strip whitespace from the start of a line up to a block tag.
    pub lstrip_blocks: bool,
    pub tags: Delimiters,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            autoescape: true,
            throw_on_undefined: false,
            trim_blocks: false,
            lstrip_blocks: false,
            tags: Delimiters::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let tags = &self.tags;
        let all = [
            ("block_start", &tags.block_start),
            ("block_end", &tags.block_end),
            ("variable_start", &tags.variable_start),
            ("variable_end", &tags.variable_end),
            ("comment_start", &tags.comment_start),
            ("comment_end", &tags.comment_end),
        ];
        if let Some((name, _)) = all.iter().find(|(_, value)| value.is_empty()) {
            return Err(TemplateError::configuration(format!(
                "invalid configuration: delimiter `{}` is empty",
                name
            )));
        }
        let starts = [&tags.block_start, &tags.variable_start, &tags.comment_start];
        for (i, a) in starts.iter().enumerate() {
            for b in &starts[i + 1..] {
                if a == b {
                    return Err(TemplateError::configuration(format!(
                        "invalid configuration: start delimiter `{}` is used twice",
                        a
                    )));
                }
            }
        }
        Ok(())
    }
}
