//! Canonical fingerprint construction for cache keys.
//!
//! A fingerprint is a stable string built from `path`, `mode`, and every
//! selection parameter in a fixed order, so two requests describing the
//! same selection always produce byte-identical cache keys regardless of
//! how their query parameters were ordered on the wire.

use crate::model::{Quality, SelectionRequest};
use std::fmt::Write;

/// Fingerprint for a preview request.
pub fn preview(path: &str, req: &SelectionRequest, max_size: Option<u32>) -> String {
    let mut s = format!("mode=preview&path={path}");
    append_selection(&mut s, req);
    if let Some(m) = max_size {
        let _ = write!(s, "&max_size={m}");
    }
    s
}

/// Fingerprint for a matrix-block request.
pub fn matrix(
    path: &str,
    req: &SelectionRequest,
    row_offset: u64,
    row_limit: u64,
    col_offset: u64,
    col_limit: u64,
) -> String {
    let mut s = format!("mode=matrix&path={path}");
    append_selection(&mut s, req);
    let _ = write!(
        s,
        "&row_offset={row_offset}&row_limit={row_limit}&col_offset={col_offset}&col_limit={col_limit}"
    );
    s
}

/// Fingerprint for a line-series request.
#[allow(clippy::too_many_arguments)]
pub fn line(
    path: &str,
    req: &SelectionRequest,
    line_dim: usize,
    line_index: u64,
    line_offset: u64,
    line_limit: u64,
    quality: Quality,
    max_points: u64,
) -> String {
    let mut s = format!("mode=line&path={path}");
    append_selection(&mut s, req);
    let _ = write!(
        s,
        "&line_dim={line_dim}&line_index={line_index}&line_offset={line_offset}&line_limit={line_limit}&quality={quality:?}&max_points={max_points}"
    );
    s
}

/// Fingerprint for a heatmap request.
pub fn heatmap(path: &str, req: &SelectionRequest, max_size: u32, include_stats: bool) -> String {
    let mut s = format!("mode=heatmap&path={path}");
    append_selection(&mut s, req);
    let _ = write!(s, "&max_size={max_size}&include_stats={include_stats}");
    s
}

/// Fingerprint for a CSV export (same selection params as `/data`).
pub fn csv(path: &str, req: &SelectionRequest) -> String {
    let mut s = format!("mode=csv&path={path}");
    append_selection(&mut s, req);
    s
}

fn append_selection(s: &mut String, req: &SelectionRequest) {
    if let Some((d0, d1)) = req.display_dims {
        let _ = write!(s, "&display_dims={d0},{d1}");
    }
    if !req.fixed_indices.is_empty() {
        // BTreeMap iterates in key order already — "sorted by dimension".
        let parts: Vec<String> =
            req.fixed_indices.iter().map(|(dim, idx)| format!("{dim}={idx}")).collect();
        let _ = write!(s, "&fixed_indices={}", parts.join(","));
    }
    if let Some((o, l)) = req.row_range {
        let _ = write!(s, "&row_range={o}:{l}");
    }
    if let Some((o, l)) = req.col_range {
        let _ = write!(s, "&col_range={o}:{l}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn same_selection_yields_same_fingerprint() {
        let mut fixed = BTreeMap::new();
        fixed.insert(2, 5u64);
        let req = SelectionRequest {
            display_dims: Some((0, 1)),
            fixed_indices: fixed,
            row_range: Some((0, 10)),
            col_range: Some((0, 4)),
        };
        let a = matrix("/d", &req, 0, 10, 0, 4);
        let b = matrix("/d", &req, 0, 10, 0, 4);
        assert_eq!(a, b);
    }

    #[test]
    fn different_offsets_yield_different_fingerprint() {
        let req = SelectionRequest::default();
        let a = matrix("/d", &req, 0, 10, 0, 4);
        let b = matrix("/d", &req, 10, 10, 0, 4);
        assert_ne!(a, b);
    }
}
