//! SQL quoting and two-phase templates.
//!
//! Statements are built in two steps. The translator first produces a
//! [`SqlTemplate`] whose dynamic parts are `%(name)s` placeholders, plus a
//! map of already-quoted values. The worker later renders the template with
//! that map (and the table names it owns). Rendering is a single pass, so a
//! substituted value is never itself scanned for placeholders.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDateTime;

use crate::error::{ReplacerError, Result};

/// Datetime format accepted by the analytical store.
pub const STORE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Named, pre-quoted template arguments.
pub type QueryArgs = BTreeMap<String, String>;

/// Quote a string literal.
pub fn escape_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

/// Quote an identifier, leaving plain (possibly nested, dotted) names bare.
pub fn escape_identifier(name: &str) -> String {
    let mut chars = name.chars();
    let plain = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        }
        _ => false,
    };
    if plain {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

/// Render a timestamp for `CAST('...' AS DateTime)`.
pub fn format_datetime(value: &NaiveDateTime) -> String {
    value.format(STORE_DATETIME_FORMAT).to_string()
}

/// Render integers as a comma separated literal list.
pub fn join_ints<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = &'a u64>,
{
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render strings as a comma separated list of quoted literals.
pub fn join_strings<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    values
        .into_iter()
        .map(|v| escape_string(v))
        .collect::<Vec<_>>()
        .join(", ")
}

enum Segment<'a> {
    Text(&'a str),
    Percent,
    Placeholder(&'a str),
}

/// A statement with `%(name)s` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTemplate {
    text: String,
}

impl SqlTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn segments(&self) -> Result<Vec<Segment<'_>>> {
        let text = self.text.as_str();
        let mut segments = Vec::new();
        let mut rest = text;

        while let Some(pos) = rest.find('%') {
            if pos > 0 {
                segments.push(Segment::Text(&rest[..pos]));
            }
            let after = &rest[pos + 1..];
            if let Some(stripped) = after.strip_prefix('%') {
                segments.push(Segment::Percent);
                rest = stripped;
            } else if let Some(open) = after.strip_prefix('(') {
                let close = open.find(")s").ok_or_else(|| {
                    ReplacerError::TemplateError(format!(
                        "unterminated placeholder at byte {}",
                        text.len() - rest.len() + pos
                    ))
                })?;
                segments.push(Segment::Placeholder(&open[..close]));
                rest = &open[close + 2..];
            } else {
                return Err(ReplacerError::TemplateError(format!(
                    "stray '%' at byte {}",
                    text.len() - rest.len() + pos
                )));
            }
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest));
        }
        Ok(segments)
    }

    /// Names of every placeholder in the template.
    pub fn placeholders(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .segments()?
            .into_iter()
            .filter_map(|s| match s {
                Segment::Placeholder(name) => Some(name.to_string()),
                _ => None,
            })
            .collect())
    }

    /// Substitute every placeholder. A missing argument is an error.
    pub fn render(&self, args: &QueryArgs) -> Result<String> {
        let mut out = String::with_capacity(self.text.len());
        for segment in self.segments()? {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Percent => out.push('%'),
                Segment::Placeholder(name) => {
                    let value = args.get(name).ok_or_else(|| {
                        ReplacerError::TemplateError(format!("missing argument '{}'", name))
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for SqlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
