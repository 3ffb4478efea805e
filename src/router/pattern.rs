//! Path patterns.
//!
//! A pattern is a `/`-separated list of segments:
//! - `users` matches that literal segment (case-sensitive)
//! - `:id` matches any one segment and captures it as `id`
//! - `*` or `*rest` (last segment only) captures the remainder of the path
//!
//! Empty segments produced by leading, trailing or doubled slashes are
//! ignored in both patterns and paths. Path segments are percent-decoded
//! after splitting, so an encoded `/` never creates a new segment.

use crate::error::{ServerError, ServerResult};
use crate::http::Params;
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashSet;

/// Key a wildcard capture is stored under when it has no name.
pub const WILDCARD_KEY: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WildcardMode {
    /// `/files/*` needs at least one segment after `/files`.
    #[default]
    OneOrMore,
    /// `/files/*` also matches `/files`, capturing an empty string.
    ZeroOrMore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
    Wildcard(Option<String>),
}

impl Segment {
    fn capture_name(&self) -> Option<&str> {
        match self {
            Segment::Literal(_) => None,
            Segment::Param(name) => Some(name),
            Segment::Wildcard(name) => Some(name.as_deref().unwrap_or(WILDCARD_KEY)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
    wildcard: WildcardMode,
}

impl PathPattern {
    pub fn compile(pattern: &str) -> ServerResult<Self> {
        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| Self::parse_segment(s, pattern))
            .collect::<ServerResult<Vec<_>>>()?;
        Self::from_segments(segments, pattern)
    }

    /// The pattern matching `/` exactly, or every path as a prefix.
    pub fn root() -> Self {
        Self {
            raw: "/".to_string(),
            segments: Vec::new(),
            wildcard: WildcardMode::default(),
        }
    }

    fn parse_segment(segment: &str, pattern: &str) -> ServerResult<Segment> {
        if let Some(name) = segment.strip_prefix(':') {
            if name.is_empty() {
                return Err(ServerError::MountConflict(format!(
                    "empty parameter name in `{pattern}`"
                )));
            }
            Ok(Segment::Param(name.to_string()))
        } else if let Some(name) = segment.strip_prefix('*') {
            Ok(Segment::Wildcard((!name.is_empty()).then(|| name.to_string())))
        } else {
            Ok(Segment::Literal(decode_segment(segment).into_owned()))
        }
    }

    fn from_segments(segments: Vec<Segment>, source: &str) -> ServerResult<Self> {
        let mut seen = HashSet::new();
        for (index, segment) in segments.iter().enumerate() {
            if matches!(segment, Segment::Wildcard(_)) && index + 1 != segments.len() {
                return Err(ServerError::MountConflict(format!(
                    "wildcard must be the last segment in `{source}`"
                )));
            }
            if let Some(name) = segment.capture_name() {
                if !seen.insert(name) {
                    return Err(ServerError::MountConflict(format!(
                        "parameter `{name}` is bound twice in `{source}`"
                    )));
                }
            }
        }

        let raw = segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(literal) => literal.clone(),
                Segment::Param(name) => format!(":{name}"),
                Segment::Wildcard(name) => format!("*{}", name.as_deref().unwrap_or("")),
            })
            .collect::<Vec<_>>()
            .join("/");

        Ok(Self {
            raw: format!("/{raw}"),
            segments,
            wildcard: WildcardMode::default(),
        })
    }

    /// `self` followed by `child`, as used when mounting a router.
    pub fn join(&self, child: &PathPattern) -> ServerResult<Self> {
        if self.has_wildcard() {
            return Err(ServerError::MountConflict(format!(
                "cannot mount under wildcard prefix `{}`",
                self.raw
            )));
        }
        let segments = self
            .segments
            .iter()
            .chain(child.segments.iter())
            .cloned()
            .collect();
        let mut joined = Self::from_segments(segments, &format!("{}{}", self.raw, child.raw))
            .map_err(|e| match e {
                ServerError::MountConflict(msg) => ServerError::MountConflict(format!(
                    "mounting `{}` at `{}`: {msg}",
                    child.raw, self.raw
                )),
                other => other,
            })?;
        joined.wildcard = child.wildcard;
        Ok(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn has_wildcard(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Wildcard(_)))
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(Segment::capture_name)
    }

    pub fn wildcard_mode(&self) -> WildcardMode {
        self.wildcard
    }

    pub fn set_wildcard_mode(&mut self, mode: WildcardMode) {
        self.wildcard = mode;
    }

    pub fn with_wildcard_mode(mut self, mode: WildcardMode) -> Self {
        self.wildcard = mode;
        self
    }

    /// Matches the whole of `path`.
    pub fn matches(&self, path: &str) -> Option<Params> {
        self.matches_segments(&split_path(path))
    }

    /// Matches the leading segments of `path`, returning the captures and
    /// how many path segments were consumed.
    pub fn matches_prefix(&self, path: &str) -> Option<(Params, usize)> {
        self.matches_prefix_segments(&split_path(path))
    }

    pub(crate) fn matches_segments(&self, path: &[Cow<'_, str>]) -> Option<Params> {
        self.match_inner(path, false).map(|(params, _)| params)
    }

    pub(crate) fn matches_prefix_segments(&self, path: &[Cow<'_, str>]) -> Option<(Params, usize)> {
        self.match_inner(path, true)
    }

    fn match_inner(&self, path: &[Cow<'_, str>], prefix: bool) -> Option<(Params, usize)> {
        let mut params = Params::new();

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(literal) => {
                    if path.get(index)? != literal {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), path.get(index)?.to_string());
                }
                Segment::Wildcard(name) => {
                    let rest = path.get(index..)?;
                    if rest.is_empty() && self.wildcard == WildcardMode::OneOrMore {
                        return None;
                    }
                    let captured = rest.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join("/");
                    let key = name.as_deref().unwrap_or(WILDCARD_KEY);
                    params.insert(key.to_string(), captured);
                    return Some((params, path.len()));
                }
            }
        }

        if !prefix && path.len() != self.segments.len() {
            return None;
        }
        Some((params, self.segments.len()))
    }
}

/// Splits a request path into percent-decoded, non-empty segments.
pub fn split_path(path: &str) -> Vec<Cow<'_, str>> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(decode_segment)
        .collect()
}

fn decode_segment(segment: &str) -> Cow<'_, str> {
    urlencoding::decode(segment).unwrap_or(Cow::Borrowed(segment))
}
