//! Patterns accepted by `expect`.

use std::fmt;
use std::ops::Range;

use memchr::memmem;
use regex::bytes::Regex;

/// What an `expect` call waits for.
///
/// Scripts mostly wait for literal prompts such as `#` or `Password:`, so the
/// literal form is the default. Regexes cover prompts that embed a hostname
/// or a variable suffix.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Exact substring.
    Literal(String),

    /// Regular expression over raw bytes.
    Regex(Regex),
}

impl Pattern {
    /// Create a literal substring pattern.
    pub fn literal(text: impl Into<String>) -> Self {
        Pattern::Literal(text.into())
    }

    /// Compile a regex pattern.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Pattern::Regex(Regex::new(pattern)?))
    }

    /// Find the first match in `data`.
    pub fn find(&self, data: &[u8]) -> Option<Range<usize>> {
        match self {
            Pattern::Literal(text) => {
                memmem::find(data, text.as_bytes()).map(|start| start..start + text.len())
            }
            Pattern::Regex(re) => re.find(data).map(|m| m.range()),
        }
    }

    /// The source text of the pattern.
    pub fn as_str(&self) -> &str {
        match self {
            Pattern::Literal(text) => text,
            Pattern::Regex(re) => re.as_str(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Literal(text) => write!(f, "{}", text),
            Pattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}
