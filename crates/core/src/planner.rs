//! C5 — Slice Planner.
//!
//! Resolves display-dim / fixed-index inputs into a concrete N-D
//! `Selection` plus a `DownsamplePlan`. Pure function of `NodeMeta` and the
//! request — no I/O, no caching, no cancellation (it never blocks).

use crate::error::{EngineError, Result};
use crate::model::{DownsamplePlan, NodeMeta, Quality, Selection, SelectionRequest};
use std::collections::BTreeMap;

pub const EXACT_MAX_POINTS: u64 = 20_000;
pub const DEFAULT_HEATMAP_MAX_SIZE: u32 = 512;

/// Resolve a `SelectionRequest` against a dataset's metadata into a
/// concrete `Selection`. `meta` must be a numeric-plottable Dataset.
pub fn resolve_selection(meta: &NodeMeta, req: &SelectionRequest) -> Result<Selection> {
    let (shape, element_type) = match meta {
        NodeMeta::Dataset { shape, element_type, .. } => (shape, element_type),
        NodeMeta::Group { .. } => {
            return Err(EngineError::BadSelection("path is a group, not a dataset".to_string()))
        }
    };
    if !element_type.is_numeric_plottable() {
        return Err(EngineError::UnsupportedElementType(format!(
            "{} is not numeric-plottable",
            element_type.dtype_string()
        )));
    }

    let ndim = shape.len();

    // Step 1: default display_dims.
    let display_dims = match req.display_dims {
        Some(d) => Some(d),
        None if ndim >= 2 => Some((0, 1)),
        None => None,
    };

    // Step 2: validate.
    if let Some((d0, d1)) = display_dims {
        if d0 >= ndim || d1 >= ndim {
            return Err(EngineError::BadSelection(format!(
                "display_dims {d0},{d1} out of range for rank {ndim}"
            )));
        }
        if d0 == d1 {
            return Err(EngineError::BadSelection("display_dims must be distinct".to_string()));
        }
    }
    for (&dim, &idx) in &req.fixed_indices {
        if dim >= ndim {
            return Err(EngineError::BadSelection(format!("fixed index dim {dim} out of range")));
        }
        if idx >= shape[dim] {
            return Err(EngineError::OutOfRange(format!(
                "fixed index {idx} out of range for dim {dim} (size {})",
                shape[dim]
            )));
        }
    }
    let display_set: std::collections::HashSet<usize> =
        display_dims.map(|(a, b)| [a, b].into_iter().collect()).unwrap_or_default();
    for dim in req.fixed_indices.keys() {
        if display_set.contains(dim) {
            return Err(EngineError::BadSelection(format!(
                "dim {dim} is both fixed and a display dim"
            )));
        }
    }

    // Step 3: impute middle index for every dim neither fixed nor displayed.
    let mut fixed_indices: BTreeMap<usize, u64> = req.fixed_indices.clone();
    for dim in 0..ndim {
        if display_set.contains(&dim) || fixed_indices.contains_key(&dim) {
            continue;
        }
        fixed_indices.insert(dim, shape[dim] / 2);
    }

    let union_len = fixed_indices.len() + display_set.len();
    if union_len != ndim {
        return Err(EngineError::BadSelection(
            "fixed_indices and display_dims do not cover every dimension".to_string(),
        ));
    }

    // Step 4: clamp row/col ranges to display-dim sizes.
    let (row_size, col_size) = match display_dims {
        Some((d0, d1)) => (shape[d0], shape[d1]),
        None => (shape.first().copied().unwrap_or(0), 1),
    };
    let row_range = clamp_range(req.row_range, row_size)?;
    let col_range = clamp_range(req.col_range, col_size)?;

    Ok(Selection { display_dims, fixed_indices, row_range, col_range })
}

fn clamp_range(requested: Option<(u64, u64)>, axis_size: u64) -> Result<(u64, u64)> {
    let (offset, limit) = requested.unwrap_or((0, axis_size));
    if offset > axis_size {
        return Err(EngineError::OutOfRange(format!(
            "offset {offset} exceeds axis size {axis_size}"
        )));
    }
    let end = offset.saturating_add(limit).min(axis_size);
    Ok((offset, end - offset))
}

/// Matrix mode: no downsampling. The caller is responsible for requesting
/// a bounded rectangle.
pub fn plan_matrix() -> DownsamplePlan {
    DownsamplePlan::NONE
}

/// Line mode: `exact` beyond `exact_max_points` (`limits.exact_line_points`,
/// defaulting to `EXACT_MAX_POINTS`) fails; `overview`/`auto` pick the
/// smallest integer stride covering `max_points`.
pub fn plan_line(
    span: u64,
    quality: Quality,
    max_points: u64,
    exact_max_points: u64,
) -> Result<(u64, Quality)> {
    match quality {
        Quality::Exact => {
            if span > exact_max_points {
                Err(EngineError::RangeTooLarge(format!(
                    "exact line request spans {span} points, max {exact_max_points}"
                )))
            } else {
                Ok((1, Quality::Exact))
            }
        }
        Quality::Overview | Quality::Auto => {
            let max_points = max_points.max(1);
            let stride = if span <= max_points { 1 } else { div_ceil(span, max_points) };
            Ok((stride, Quality::Overview))
        }
    }
}

/// Heatmap mode: choose per-axis strides so the sampled grid fits within
/// `max_size` on each side, capped at `heatmap_max_side`.
pub fn plan_heatmap(
    rows: u64,
    cols: u64,
    requested_max_size: u32,
    heatmap_max_side: u32,
) -> (DownsamplePlan, u32, bool) {
    let clamped = requested_max_size > heatmap_max_side;
    let effective_max_size = requested_max_size.min(heatmap_max_side).max(1);
    let row_stride = if rows <= effective_max_size as u64 {
        1
    } else {
        div_ceil(rows, effective_max_size as u64)
    };
    let col_stride = if cols <= effective_max_size as u64 {
        1
    } else {
        div_ceil(cols, effective_max_size as u64)
    };
    (DownsamplePlan { row_stride, col_stride }, effective_max_size, clamped)
}

pub fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Resolve a dedicated 1-D selection for Line mode: every dimension other
/// than `line_dim` is fixed. `line_index`, when given, overrides the
/// imputed index for the dimension immediately after `line_dim` (cyclic) —
/// the common "row N of a 2-D array, plotted along its columns" case;
/// any further dimensions and any dims named in `fixed_indices` follow the
/// same validate-then-impute rule as `resolve_selection`. Returns the full
/// axis shape, the resolved fixed indices, and
/// the line dimension's size (the extraction span before striding).
pub fn resolve_line_selection(
    meta: &NodeMeta,
    line_dim: usize,
    mut fixed_indices: BTreeMap<usize, u64>,
    line_index: Option<u64>,
) -> Result<(Vec<u64>, BTreeMap<usize, u64>, u64)> {
    let (shape, element_type) = match meta {
        NodeMeta::Dataset { shape, element_type, .. } => (shape, element_type),
        NodeMeta::Group { .. } => {
            return Err(EngineError::BadSelection("path is a group, not a dataset".to_string()))
        }
    };
    if !element_type.is_numeric_plottable() {
        return Err(EngineError::UnsupportedElementType(format!(
            "{} is not numeric-plottable",
            element_type.dtype_string()
        )));
    }
    let ndim = shape.len();
    if line_dim >= ndim {
        return Err(EngineError::BadSelection(format!("line_dim {line_dim} out of range for rank {ndim}")));
    }
    for (&dim, &idx) in &fixed_indices {
        if dim == line_dim {
            return Err(EngineError::BadSelection("line_dim cannot also be fixed".to_string()));
        }
        if dim >= ndim || idx >= shape[dim] {
            return Err(EngineError::OutOfRange(format!("fixed index {idx} out of range for dim {dim}")));
        }
    }

    if let Some(idx) = line_index {
        let secondary = (line_dim + 1) % ndim;
        if secondary != line_dim && !fixed_indices.contains_key(&secondary) {
            if idx >= shape[secondary] {
                return Err(EngineError::OutOfRange(format!(
                    "line_index {idx} out of range for dim {secondary} (size {})",
                    shape[secondary]
                )));
            }
            fixed_indices.insert(secondary, idx);
        }
    }

    for dim in 0..ndim {
        if dim != line_dim {
            fixed_indices.entry(dim).or_insert(shape[dim] / 2);
        }
    }

    Ok((shape.clone(), fixed_indices, shape[line_dim]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ByteOrder, ElementType};

    fn dataset_meta(shape: Vec<u64>) -> NodeMeta {
        NodeMeta::Dataset {
            path: "/d".to_string(),
            ndim: shape.len(),
            size: crate::model::element_count(&shape),
            shape,
            dtype: "int32".to_string(),
            element_type: ElementType::Integer { signed: true, bits: 32, order: ByteOrder::Little },
            chunks: None,
            compression: None,
            filters: vec![],
            attributes: vec![],
        }
    }

    #[test]
    fn defaults_display_dims_for_rank_2() {
        let meta = dataset_meta(vec![18, 4]);
        let sel = resolve_selection(&meta, &SelectionRequest::default()).unwrap();
        assert_eq!(sel.display_dims, Some((0, 1)));
        assert_eq!(sel.row_range, (0, 18));
        assert_eq!(sel.col_range, (0, 4));
    }

    #[test]
    fn imputes_middle_index_for_unreferenced_dims() {
        let meta = dataset_meta(vec![10, 20, 30]);
        let req = SelectionRequest { display_dims: Some((0, 2)), ..Default::default() };
        let sel = resolve_selection(&meta, &req).unwrap();
        assert_eq!(sel.fixed_indices.get(&1), Some(&10));
    }

    #[test]
    fn rejects_out_of_range_display_dim() {
        let meta = dataset_meta(vec![10, 20]);
        let req = SelectionRequest { display_dims: Some((0, 5)), ..Default::default() };
        assert!(resolve_selection(&meta, &req).is_err());
    }

    #[test]
    fn line_downsample_matches_ceil_law() {
        // returned length == ceil(L/s).
        let (stride, quality) = plan_line(10_000, Quality::Overview, 100, EXACT_MAX_POINTS).unwrap();
        assert_eq!(stride, 100);
        assert_eq!(quality, Quality::Overview);
        let returned = div_ceil(10_000, stride);
        assert_eq!(returned, 100);
    }

    #[test]
    fn exact_line_over_budget_is_range_too_large() {
        let err = plan_line(50_000, Quality::Exact, 100, EXACT_MAX_POINTS).unwrap_err();
        assert_eq!(err.code(), "RANGE_TOO_LARGE");
    }

    #[test]
    fn exact_line_honors_configured_ceiling_not_the_default() {
        let err = plan_line(10_000, Quality::Exact, 100, 5_000).unwrap_err();
        assert_eq!(err.code(), "RANGE_TOO_LARGE");
        assert!(plan_line(4_000, Quality::Exact, 100, 5_000).is_ok());
    }

    #[test]
    fn heatmap_clamps_to_configured_ceiling() {
        let (plan, effective, clamped) = plan_heatmap(2000, 2000, 1024, 512);
        assert_eq!(effective, 512);
        assert!(clamped);
        assert_eq!(plan.row_stride, 4);
    }
}
