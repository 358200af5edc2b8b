//! # Recipient Resolver
//!
//! Expands a recipient expression into the ordered list of node names it
//! denotes.
//!
//! ```text
//! expr     := "all" | segment ("," segment)*
//! segment  := prefix [ "[" items "]" suffix ]
//! items    := item ("," item)*
//! item     := number | number "-" number
//! ```
//!
//! `kn[1-3,7],db` expands to `kn1 kn2 kn3 kn7 db`. A lower bound written
//! with leading zeros keeps its width: `kn[01-10]` gives `kn01 … kn10`.
//! Output order follows the expression; nothing is sorted or deduplicated.
//! An expression may denote at most `MAX_RECIPIENTS` names.

use crate::error::MeshError;
use crate::identity::NodeName;
use crate::view::Mesh;

/// Expression that addresses every node in the current view.
pub const ALL: &str = "all";

/// Largest number of names one expression may expand to.
pub const MAX_RECIPIENTS: usize = 65_536;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanState {
    Outside,
    Inside,
}

fn syntax(msg: impl Into<String>) -> MeshError {
    MeshError::RangeSyntax(msg.into())
}

/// Split on commas that are not inside brackets.
fn split_segments(expr: &str) -> Result<Vec<&str>, MeshError> {
    let mut segments = Vec::new();
    let mut state = ScanState::Outside;
    let mut start = 0;

    for (i, c) in expr.char_indices() {
        match (state, c) {
            (ScanState::Outside, '[') => state = ScanState::Inside,
            (ScanState::Outside, ']') => {
                return Err(syntax(format!("unmatched ']' at offset {} in {:?}", i, expr)));
            }
            (ScanState::Outside, ',') => {
                segments.push(&expr[start..i]);
                start = i + 1;
            }
            (ScanState::Inside, '[') => {
                return Err(syntax(format!("nested '[' at offset {} in {:?}", i, expr)));
            }
            (ScanState::Inside, ']') => state = ScanState::Outside,
            _ => {}
        }
    }
    if state == ScanState::Inside {
        return Err(syntax(format!("unbalanced '[' in {:?}", expr)));
    }
    segments.push(&expr[start..]);
    Ok(segments)
}

fn parse_bound(item: &str, text: &str) -> Result<u64, MeshError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(syntax(format!("non-numeric range item {:?}", item)));
    }
    text.parse()
        .map_err(|_| syntax(format!("range bound out of range in {:?}", item)))
}

fn too_many(count: u64) -> MeshError {
    syntax(format!(
        "expression expands to {} or more names (max {})",
        count, MAX_RECIPIENTS
    ))
}

/// Expand one bracket body (`1-3,7`) into formatted numbers. `already`
/// names were produced by earlier segments of the same expression.
fn expand_items(body: &str, already: usize) -> Result<Vec<String>, MeshError> {
    if body.is_empty() {
        return Err(syntax("empty range"));
    }
    let mut out = Vec::new();
    for item in body.split(',') {
        if item.is_empty() {
            return Err(syntax(format!("empty item in range [{}]", body)));
        }
        let (lo_text, hi_text) = match item.split_once('-') {
            Some((lo, hi)) => (lo, hi),
            None => (item, item),
        };
        let lo = parse_bound(item, lo_text)?;
        let hi = parse_bound(item, hi_text)?;
        if lo > hi {
            return Err(syntax(format!("reversed range {:?}", item)));
        }
        let total = (hi - lo)
            .saturating_add(1)
            .saturating_add((already + out.len()) as u64);
        if total > MAX_RECIPIENTS as u64 {
            return Err(too_many(total));
        }
        let width = if lo_text.len() > 1 && lo_text.starts_with('0') {
            lo_text.len()
        } else {
            0
        };
        out.extend((lo..=hi).map(|n| format!("{:0width$}", n, width = width)));
    }
    Ok(out)
}

fn expand_segment(segment: &str, already: usize) -> Result<Vec<String>, MeshError> {
    if segment.is_empty() {
        return Err(syntax("empty recipient"));
    }
    let Some(open) = segment.find('[') else {
        return Ok(vec![segment.to_string()]);
    };
    // split_segments guarantees a matching ']' after '['.
    let close = segment[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| syntax(format!("unbalanced '[' in {:?}", segment)))?;
    let prefix = &segment[..open];
    let body = &segment[open + 1..close];
    let suffix = &segment[close + 1..];
    if suffix.contains('[') {
        return Err(syntax(format!("more than one range in {:?}", segment)));
    }
    Ok(expand_items(body, already)?
        .into_iter()
        .map(|n| format!("{}{}{}", prefix, n, suffix))
        .collect())
}

/// Expand a recipient expression into host strings, without consulting
/// the mesh. `"all"` is returned as-is.
pub fn expand_recipients(expr: &str) -> Result<Vec<String>, MeshError> {
    let expr = expr.trim();
    if expr == ALL {
        return Ok(vec![ALL.to_string()]);
    }
    let mut hosts = Vec::new();
    for segment in split_segments(expr)? {
        let names = expand_segment(segment, hosts.len())?;
        hosts.extend(names);
        if hosts.len() > MAX_RECIPIENTS {
            return Err(too_many(hosts.len() as u64));
        }
    }
    Ok(hosts)
}

/// Resolve a recipient expression to node names against a snapshot.
pub fn resolve(expr: &str, mesh: &Mesh) -> Result<Vec<NodeName>, MeshError> {
    if expr.trim() == ALL {
        return Ok(mesh.keys().cloned().collect());
    }
    expand_recipients(expr)?
        .into_iter()
        .map(|host| {
            NodeName::new(&host)
                .map_err(|_| syntax(format!("invalid node name {:?}", host)))
        })
        .collect()
}
