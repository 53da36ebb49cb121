//! Wildcard URI patterns.
//!
//! Patterns are split on `/` and matched segment by segment:
//!
//! - `*` inside a segment matches any run of characters of that one segment,
//!   so `*.json` matches `a.json` but never `a/b.json`
//! - a segment that is exactly `**` matches zero or more whole segments
//! - everything else, scheme and authority included, matches literally and
//!   case-sensitively
//!
//! A bare `*` pattern is read as `**` and matches every URI.
//!
//! Malformed patterns are rejected by [`UriPattern::parse`]; the free
//! function [`matches`] treats them as matching nothing.

use thiserror::Error;

/// Errors raised while parsing a wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern must not be empty")]
    Empty,

    #[error("unknown wildcard token `{token}` in segment `{segment}`")]
    UnknownToken { token: String, segment: String },

    #[error("unbalanced `{0}` in pattern")]
    Unbalanced(char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// Segment with one or more single `*` wildcards
    Glob(String),
    /// `**`
    AnyDepth,
}

impl Segment {
    fn matches(&self, segment: &str) -> bool {
        match self {
            Segment::Literal(literal) => literal == segment,
            Segment::Glob(glob) => glob_matches(glob.as_bytes(), segment.as_bytes()),
            Segment::AnyDepth => true,
        }
    }
}

/// A parsed wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl UriPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }
        check_balanced(pattern)?;

        if pattern == "*" || pattern == "**" {
            return Ok(Self {
                raw: pattern.to_string(),
                segments: vec![Segment::AnyDepth],
            });
        }

        let mut segments: Vec<Segment> = Vec::new();
        for segment in pattern.split('/') {
            let parsed = if segment == "**" {
                Segment::AnyDepth
            } else if let Some(token) = longest_star_run(segment).filter(|run| run.len() > 1) {
                return Err(PatternError::UnknownToken {
                    token: token.to_string(),
                    segment: segment.to_string(),
                });
            } else if segment.contains('*') {
                Segment::Glob(segment.to_string())
            } else {
                Segment::Literal(segment.to_string())
            };

            // `**/**` is the same as `**`
            if parsed == Segment::AnyDepth && segments.last() == Some(&Segment::AnyDepth) {
                continue;
            }
            segments.push(parsed);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Text before the first wildcard. Every URI this pattern matches starts with it.
    ///
    /// A `**` segment may match zero segments, taking its leading `/` with it,
    /// so that separator is not part of the prefix.
    pub fn literal_prefix(&self) -> &str {
        let Some(end) = self.raw.find('*') else {
            return &self.raw;
        };
        let prefix = &self.raw[..end];
        if self.raw[end..].starts_with("**") {
            prefix.strip_suffix('/').unwrap_or(prefix)
        } else {
            prefix
        }
    }

    /// True when the pattern contains no wildcard at all.
    pub fn is_literal(&self) -> bool {
        !self.raw.contains('*')
    }

    pub fn matches(&self, uri: &str) -> bool {
        let parts: Vec<&str> = uri.split('/').collect();
        match_segments(&self.segments, &parts)
    }
}

impl std::fmt::Display for UriPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for UriPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Match a concrete URI against a pattern string.
///
/// Deterministic and side-effect free. An empty or malformed pattern matches nothing.
pub fn matches(pattern: &str, uri: &str) -> bool {
    UriPattern::parse(pattern)
        .map(|p| p.matches(uri))
        .unwrap_or(false)
}

/// Segment-level counterpart of [`glob_matches`] with `**` as the star.
///
/// Only the most recent `**` is ever resumed, so the work stays bounded by
/// `pattern.len() * parts.len()` segment comparisons.
fn match_segments(pattern: &[Segment], parts: &[&str]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut any_depth: Option<usize> = None;
    let mut resume_at = 0;

    while t < parts.len() {
        match pattern.get(p) {
            Some(Segment::AnyDepth) => {
                any_depth = Some(p);
                resume_at = t;
                p += 1;
            }
            Some(segment) if segment.matches(parts[t]) => {
                p += 1;
                t += 1;
            }
            _ => match any_depth {
                Some(s) => {
                    p = s + 1;
                    resume_at += 1;
                    t = resume_at;
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|s| matches!(s, Segment::AnyDepth))
}

/// Glob match where `*` matches any (possibly empty) run of bytes.
fn glob_matches(glob: &[u8], text: &[u8]) -> bool {
    let (mut g, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_text = 0;

    while t < text.len() {
        if g < glob.len() && glob[g] == b'*' {
            star = Some(g);
            star_text = t;
            g += 1;
        } else if g < glob.len() && glob[g] == text[t] {
            g += 1;
            t += 1;
        } else if let Some(s) = star {
            g = s + 1;
            star_text += 1;
            t = star_text;
        } else {
            return false;
        }
    }

    glob[g..].iter().all(|b| *b == b'*')
}

fn longest_star_run(segment: &str) -> Option<&str> {
    let mut best: Option<&str> = None;
    let mut start = None;

    for (i, c) in segment.char_indices().chain(std::iter::once((segment.len(), '\0'))) {
        match (c == '*', start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                let run = &segment[s..i];
                if best.is_none_or(|b| run.len() > b.len()) {
                    best = Some(run);
                }
                start = None;
            }
            _ => {}
        }
    }

    best
}

fn check_balanced(pattern: &str) -> Result<(), PatternError> {
    let mut stack = Vec::new();
    for c in pattern.chars() {
        match c {
            '[' | '{' => stack.push(c),
            ']' | '}' => {
                let open = if c == ']' { '[' } else { '{' };
                if stack.pop() != Some(open) {
                    return Err(PatternError::Unbalanced(c));
                }
            }
            _ => {}
        }
    }
    match stack.pop() {
        Some(open) => Err(PatternError::Unbalanced(open)),
        None => Ok(()),
    }
}
