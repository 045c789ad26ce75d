//! Template errors.
//!
//! Every failure in the pipeline (lexing, parsing, name resolution, evaluation or a
//! host collaborator) is reported as a [`TemplateError`]. Errors carry the position
//! of the node that raised them and, as they travel back up through includes,
//! imports and `extends`, the chain of templates they passed through.

use std::fmt;

use thiserror::Error;

pub type Result<T, E = TemplateError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unterminated comment/string/regex or an unrecognised character sequence.
    Lexical,
    /// Missing end tag, unexpected token, unknown block tag.
    Syntax,
    /// Template, block, filter, test or import name not found.
    Resolution,
    /// Failure while rendering: undefined output in strict mode, calling a
    /// non-function, missing super block, bad operands.
    Evaluation,
    /// Failure reported by a loader, filter or extension.
    Collaborator,
    /// Invalid [`Config`](crate::Config), such as an empty or reused delimiter.
    Configuration,
}

impl ErrorKind {
    fn label(self) -> &'static str {
        match self {
            ErrorKind::Lexical => "Lexical Error",
            ErrorKind::Syntax => "Syntax Error",
            ErrorKind::Resolution => "Resolution Error",
            ErrorKind::Evaluation => "Evaluation Error",
            ErrorKind::Collaborator => "Error",
            ErrorKind::Configuration => "Configuration Error",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{}", Report(self))]
pub struct TemplateError {
    kind: ErrorKind,
    message: String,
    line: Option<usize>,
    column: Option<usize>,
    template: Option<String>,
    chain: Vec<String>,
}

impl TemplateError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            column: None,
            template: None,
            chain: Vec::new(),
        }
    }

    pub fn lexical(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self::new(ErrorKind::Lexical, message).at(line, column)
    }

    pub fn syntax(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self::new(ErrorKind::Syntax, message).at(line, column)
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resolution, message)
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Evaluation, message)
    }

    /// Wrap a failure reported by a loader, filter or extension.
    pub fn collaborator(message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Collaborator, message.to_string())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Attach a position unless the error already has one.
    pub fn at(mut self, line: usize, column: usize) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
            self.column = Some(column);
        }
        self
    }

    /// Record that the error passed through `template`. The first template
    /// recorded is the one that owns the position; later ones form the chain of
    /// includes/imports/extends that led to it.
    pub fn update(mut self, template: &str) -> Self {
        match &self.template {
            None => self.template = Some(template.to_string()),
            Some(owner) => {
                // Passing the same boundary twice records it once
                if self.chain.last().unwrap_or(owner) != template {
                    self.chain.push(template.to_string());
                }
            }
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn line(&self) -> Option<usize> {
        self.line
    }

    pub fn column(&self) -> Option<usize> {
        self.column
    }

    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    pub fn chain(&self) -> &[String] {
        &self.chain
    }
}

struct Report<'a>(&'a TemplateError);

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let err = self.0;
        let location = match (err.line, err.column) {
            (Some(line), Some(column)) => Some(format!("[Line {}, Column {}]", line, column)),
            _ => None,
        };
        match (&err.template, location) {
            (Some(template), Some(location)) => write!(f, "({}) {}\n  ", template, location)?,
            (Some(template), None) => write!(f, "({})\n  ", template)?,
            (None, Some(location)) => write!(f, "{}\n  ", location)?,
            (None, None) => {}
        }
        write!(f, "{}: {}", err.kind.label(), err.message)?;
        if !err.chain.is_empty() {
            write!(f, "\n  via {}", err.chain.join(" <- "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_is_set_once() {
        let err = TemplateError::evaluation("boom").at(3, 4).at(9, 9);
        assert_eq!(err.line(), Some(3));
        assert_eq!(err.column(), Some(4));
    }

    #[test]
    fn update_builds_template_chain() {
        let err = TemplateError::syntax("unexpected token", 2, 5)
            .update("partial.html")
            .update("page.html")
            .update("base.html");
        assert_eq!(err.template(), Some("partial.html"));
        assert_eq!(err.chain(), ["page.html".to_string(), "base.html".to_string()]);

        let text = err.to_string();
        assert!(text.starts_with("(partial.html) [Line 2, Column 5]"));
        assert!(text.contains("Syntax Error: unexpected token"));
        assert!(text.contains("via page.html <- base.html"));
    }

    #[test]
    fn repeated_update_is_recorded_once() {
        let err = TemplateError::evaluation("boom")
            .update("a.html")
            .update("a.html")
            .update("b.html")
            .update("b.html");
        assert_eq!(err.template(), Some("a.html"));
        assert_eq!(err.chain(), ["b.html".to_string()]);
    }

    #[test]
    fn bare_error_displays_kind_and_message() {
        let err = TemplateError::resolution("template not found: missing.html");
        assert_eq!(err.to_string(), "Resolution Error: template not found: missing.html");
    }
}
