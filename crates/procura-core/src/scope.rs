//! Resource URN patterns and scope subset checks.
//!
//! Resources are `:`-delimited URNs (`provider:product:resource`, e.g.
//! `openai:gpt-4:completions`). Patterns may use two wildcards:
//!
//! - `*` matches exactly one segment
//! - `**` matches one or more segments
//!
//! A pattern without wildcards is a literal match. Matching is segment-wise
//! and deterministic (greedy-left on `**`).
//!
//! Subset between scopes is decided syntactically: child pattern `c` is
//! covered by parent pattern `p` when `p` matches every string `c` matches
//! (`p` is a prefix-generalization of `c`). This is a sufficient condition,
//! which is the correct direction for an authority check: a pattern pair the
//! check cannot prove is treated as out of scope.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of `:`-delimited segments in a resource or pattern.
pub const MAX_SEGMENTS: usize = 8;

/// Maximum length of a single segment.
pub const MAX_SEGMENT_LENGTH: usize = 128;

/// Errors from pattern parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// Pattern or resource string was empty.
    #[error("empty pattern")]
    Empty,

    /// A segment was empty (`a::b`).
    #[error("empty segment in '{pattern}'")]
    EmptySegment {
        /// The offending pattern.
        pattern: String,
    },

    /// Too many segments.
    #[error("'{pattern}' has more than {MAX_SEGMENTS} segments")]
    TooManySegments {
        /// The offending pattern.
        pattern: String,
    },

    /// A segment was too long.
    #[error("segment longer than {MAX_SEGMENT_LENGTH} bytes in '{pattern}'")]
    SegmentTooLong {
        /// The offending pattern.
        pattern: String,
    },

    /// A segment mixed a wildcard with other characters (`ab*`).
    #[error("wildcard must be a whole segment in '{pattern}'")]
    PartialWildcard {
        /// The offending pattern.
        pattern: String,
    },
}

/// One segment of a parsed pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    /// Exact segment text.
    Literal(String),
    /// `*`: exactly one segment.
    Any,
    /// `**`: one or more segments.
    Many,
}

/// A parsed resource pattern.
///
/// Serializes as its string form so scopes stored in mandates and policies
/// stay human-readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePattern {
    segments: Vec<Segment>,
    text: String,
}

impl ResourcePattern {
    /// Parses a pattern string.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] describing the first violation.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }
        let raw: Vec<&str> = pattern.split(':').collect();
        if raw.len() > MAX_SEGMENTS {
            return Err(PatternError::TooManySegments {
                pattern: pattern.to_string(),
            });
        }
        let mut segments = Vec::with_capacity(raw.len());
        for part in raw {
            if part.is_empty() {
                return Err(PatternError::EmptySegment {
                    pattern: pattern.to_string(),
                });
            }
            if part.len() > MAX_SEGMENT_LENGTH {
                return Err(PatternError::SegmentTooLong {
                    pattern: pattern.to_string(),
                });
            }
            segments.push(match part {
                "*" => Segment::Any,
                "**" => Segment::Many,
                other => {
                    if other.contains('*') {
                        return Err(PatternError::PartialWildcard {
                            pattern: pattern.to_string(),
                        });
                    }
                    Segment::Literal(other.to_string())
                },
            });
        }
        Ok(Self {
            segments,
            text: pattern.to_string(),
        })
    }

    /// Returns the original pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns true if this pattern contains no wildcards.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Tests whether a concrete resource URN matches this pattern.
    ///
    /// The resource is split on `:`; wildcards in the resource itself are
    /// treated as literal text (a request for resource `a:*` is the
    /// two-segment string, not a pattern).
    #[must_use]
    pub fn matches(&self, resource: &str) -> bool {
        if resource.is_empty() {
            return false;
        }
        let parts: Vec<&str> = resource.split(':').collect();
        if parts.len() > MAX_SEGMENTS || parts.iter().any(|p| p.is_empty()) {
            return false;
        }
        match_segments(&self.segments, &parts)
    }

    /// Tests whether this pattern covers every resource `child` can match.
    ///
    /// Used for the scope-subset invariant at issue time and re-verified by
    /// the evaluator.
    #[must_use]
    pub fn covers(&self, child: &Self) -> bool {
        cover_segments(&self.segments, &child.segments)
    }
}

impl std::fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

impl TryFrom<String> for ResourcePattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourcePattern> for String {
    fn from(pattern: ResourcePattern) -> Self {
        pattern.text
    }
}

fn match_segments(pattern: &[Segment], parts: &[&str]) -> bool {
    match pattern.split_first() {
        None => parts.is_empty(),
        Some((Segment::Literal(lit), rest)) => parts
            .split_first()
            .is_some_and(|(head, tail)| lit == head && match_segments(rest, tail)),
        Some((Segment::Any, rest)) => parts
            .split_first()
            .is_some_and(|(_, tail)| match_segments(rest, tail)),
        Some((Segment::Many, rest)) => {
            // Greedy-left: `**` consumes at least one segment, then yields.
            for split in 1..=parts.len() {
                if match_segments(rest, &parts[split..]) {
                    return true;
                }
            }
            false
        },
    }
}

fn cover_segments(parent: &[Segment], child: &[Segment]) -> bool {
    match (parent.split_first(), child.split_first()) {
        (None, None) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some((p, p_rest)), Some((c, c_rest))) => match p {
            // A literal only covers the identical literal.
            Segment::Literal(lp) => {
                matches!(c, Segment::Literal(lc) if lp == lc) && cover_segments(p_rest, c_rest)
            },
            // `*` covers any single-segment child form; it cannot cover
            // `**`, which may span several segments.
            Segment::Any => {
                !matches!(c, Segment::Many) && cover_segments(p_rest, c_rest)
            },
            // `**` absorbs one child segment (a child `**` is absorbed
            // whole, since the parent `**` matches whatever it expands to)
            // and may keep absorbing further segments.
            Segment::Many => {
                cover_segments(p_rest, c_rest)
                    || (!c_rest.is_empty() && cover_segments(parent, c_rest))
            },
        },
    }
}

/// Tests whether every pattern in `child` is covered by some pattern in
/// `parent` (scope subset).
#[must_use]
pub fn scope_is_subset(child: &[ResourcePattern], parent: &[ResourcePattern]) -> bool {
    child
        .iter()
        .all(|c| parent.iter().any(|p| p.covers(c)))
}

/// Tests whether a concrete resource matches any pattern in `scope`.
#[must_use]
pub fn scope_matches(scope: &[ResourcePattern], resource: &str) -> bool {
    scope.iter().any(|p| p.matches(resource))
}
