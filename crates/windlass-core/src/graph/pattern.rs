//! Compiled node-id patterns.
//!
//! A node id may contain `{param}` placeholder segments ("process-{item}")
//! so one declared node can stand for many runtime instances. Patterns are
//! compiled once at validation time and matched explicitly: matching is
//! anchored, placeholders capture at least one character, and a runtime name
//! matching more than one declared pattern is a hard configuration error at
//! the resolution site, never a silent pick.

// ---------------------------------------------------------------------------
// NodePattern
// ---------------------------------------------------------------------------

/// A compiled templated node id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Whether a node id contains placeholder segments.
pub fn is_templated(node_id: &str) -> bool {
    node_id.contains('{')
}

impl NodePattern {
    /// Compile a templated node id. Returns `None` when the id has no
    /// placeholders (exact ids don't need a pattern).
    pub fn compile(node_id: &str) -> Option<Self> {
        if !is_templated(node_id) {
            return None;
        }

        let mut segments = Vec::new();
        let mut rest = node_id;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                // Unterminated placeholder: treat the remainder as literal.
                segments.push(Segment::Literal(rest[open..].to_string()));
                rest = "";
                break;
            };
            segments.push(Segment::Param(after[..close].to_string()));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Some(Self { segments })
    }

    /// Anchored match of a runtime step name against this pattern.
    pub fn matches(&self, name: &str) -> bool {
        match_segments(&self.segments, name)
    }
}

/// Backtracking segment matcher: literals must appear in order, placeholders
/// absorb one or more characters.
fn match_segments(segments: &[Segment], name: &str) -> bool {
    match segments.first() {
        None => name.is_empty(),
        Some(Segment::Literal(lit)) => name
            .strip_prefix(lit.as_str())
            .is_some_and(|rest| match_segments(&segments[1..], rest)),
        Some(Segment::Param(_)) => {
            if segments.len() == 1 {
                return !name.is_empty();
            }
            (1..=name.len())
                .filter(|i| name.is_char_boundary(*i))
                .any(|i| match_segments(&segments[1..], &name[i..]))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
