//! Minimal `{{name}}` template substitution (§4.5, §9).
//!
//! Deliberately not a templating language: no conditionals, no loops, no
//! expressions, no code execution. A phase prompt template is plain text
//! with `{{placeholder}}` markers; rendering does string lookups and
//! nothing else. An unbound placeholder is a hard error rather than
//! silently rendering empty — a prompt missing context produces worse
//! agent output than a visible failure.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),
    #[error("empty placeholder at byte {0}")]
    EmptyName(usize),
    #[error("unbound placeholder '{0}'")]
    Unbound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template, ready to render against any variable set. Parsing
/// happens once so repeated renders (e.g. across retry attempts with an
/// updated `attempt` variable) don't re-scan the template text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let bytes = source.as_bytes();
        let mut segments = Vec::new();
        let mut literal_start = 0;
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] == b'{' && bytes.get(i + 1) == Some(&b'{') {
                if literal_start < i {
                    segments.push(Segment::Literal(source[literal_start..i].to_string()));
                }
                let name_start = i + 2;
                let Some(end) = source[name_start..].find("}}") else {
                    return Err(TemplateError::Unterminated(i));
                };
                let name = source[name_start..name_start + end].trim();
                if name.is_empty() {
                    return Err(TemplateError::EmptyName(i));
                }
                segments.push(Segment::Placeholder(name.to_string()));
                i = name_start + end + 2;
                literal_start = i;
            } else {
                i += 1;
            }
        }

        if literal_start < bytes.len() {
            segments.push(Segment::Literal(source[literal_start..].to_string()));
        }

        Ok(Self { segments })
    }

    /// The set of placeholder names this template references, in order of
    /// first appearance. Lets a caller validate a variable set is complete
    /// before running the (potentially expensive) agent invocation.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for segment in &self.segments {
            if let Segment::Placeholder(name) = segment
                && !seen.contains(&name.as_str())
            {
                seen.push(name.as_str());
            }
        }
        seen
    }

    pub fn render(&self, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(TemplateError::Unbound(name.clone())),
                },
            }
        }
        Ok(out)
    }
}
