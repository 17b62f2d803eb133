//! C6 — Extraction Engine.
//!
//! Executes previews, matrix blocks, line windows, heatmap reductions, and
//! CSV streams against a planner-resolved selection. Every function here
//! takes an already-acquired `ContainerHandle` and a `CancellationToken`
//! checked between block reads — none of them touch
//! storage or the caches directly.

use crate::error::{EngineError, Result};
use crate::hdf5util::{read_hyperslab_f64, value_to_json, AxisSlab};
use crate::model::{
    ElementType, ExtractionResult, NodeMeta, Quality, Selection, SelectionRequest, Stats,
};
use crate::planner::{self, div_ceil};
use crate::pool::ContainerHandle;
use ndarray::{ArrayD, IxDyn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Reject extractions whose requested element count would exceed the
/// configured ceiling before any read is attempted
/// (`limits.max_extract_elements`).
pub fn check_element_ceiling(count: u128, ceiling: u64) -> Result<()> {
    if count > ceiling as u128 {
        Err(EngineError::RangeTooLarge(format!(
            "selection has {count} elements, ceiling is {ceiling}"
        )))
    } else {
        Ok(())
    }
}

fn open_dataset(handle: &ContainerHandle, path: &str) -> Result<(hdf5::Dataset, NodeMeta)> {
    let meta = crate::hierarchy::meta(handle, path)?;
    let dataset = handle.with_file(|file| {
        file.dataset(path.trim_start_matches('/')).map_err(|_| EngineError::NotFound(path.to_string()))
    })?;
    Ok((dataset, meta))
}

fn build_axes(ndim: usize, sel: &Selection, row_stride: u64, col_stride: u64) -> Vec<AxisSlab> {
    (0..ndim)
        .map(|dim| {
            if let Some((d0, d1)) = sel.display_dims {
                if dim == d0 {
                    return AxisSlab {
                        start: sel.row_range.0,
                        stride: row_stride,
                        count: div_ceil(sel.row_range.1, row_stride),
                    };
                }
                if dim == d1 {
                    return AxisSlab {
                        start: sel.col_range.0,
                        stride: col_stride,
                        count: div_ceil(sel.col_range.1, col_stride),
                    };
                }
            } else if dim == 0 {
                return AxisSlab {
                    start: sel.row_range.0,
                    stride: row_stride,
                    count: div_ceil(sel.row_range.1, row_stride),
                };
            }
            let idx = *sel.fixed_indices.get(&dim).unwrap_or(&0);
            AxisSlab { start: idx, stride: 1, count: 1 }
        })
        .collect()
}

fn reshape(arr: ArrayD<f64>, dims: &[usize]) -> Result<ArrayD<f64>> {
    arr.into_shape(IxDyn(dims))
        .map_err(|e| EngineError::CorruptContainer(format!("shape mismatch after read: {e}")))
}

fn to_2d_json(arr: &ArrayD<f64>, element_type: &ElementType) -> Vec<Vec<serde_json::Value>> {
    arr.rows()
        .into_iter()
        .map(|row| row.iter().map(|&v| value_to_json(v, element_type)).collect())
        .collect()
}

fn to_1d_json(arr: &ArrayD<f64>, element_type: &ElementType) -> Vec<serde_json::Value> {
    arr.iter().map(|&v| value_to_json(v, element_type)).collect()
}

async fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Preview
// ---------------------------------------------------------------------------

const PREVIEW_MAX_SIZE: u32 = 512;
const PREVIEW_LINE_MAX_POINTS: u64 = 1000;

/// Auto-picks a mode based on rank: 1-D -> 1-D sample; 2-D -> 2-D sample
/// decimated to <= 512 per axis; >=3-D -> same as 2-D after imputed fixed
/// indices.
pub async fn preview(
    handle: &ContainerHandle,
    path: &str,
    req: &SelectionRequest,
    max_size: Option<u32>,
    ceiling: u64,
    cancel: &CancellationToken,
) -> Result<ExtractionResult> {
    check_cancelled(cancel).await?;
    let (dataset, meta) = open_dataset(handle, path)?;
    let (shape, element_type, ndim) = match &meta {
        NodeMeta::Dataset { shape, element_type, ndim, .. } => (shape, element_type, *ndim),
        NodeMeta::Group { .. } => {
            return Err(EngineError::BadSelection("path is a group, not a dataset".to_string()))
        }
    };
    let max_size = max_size.unwrap_or(PREVIEW_MAX_SIZE).min(PREVIEW_MAX_SIZE);

    if ndim <= 1 {
        let span = shape.first().copied().unwrap_or(0);
        let (stride, quality) = planner::plan_line(
            span,
            Quality::Overview,
            PREVIEW_LINE_MAX_POINTS,
            planner::EXACT_MAX_POINTS,
        )?;
        let count = div_ceil(span, stride);
        check_element_ceiling(count as u128, ceiling)?;
        let axes = vec![AxisSlab { start: 0, stride, count }];
        let arr = read_hyperslab_f64(&dataset, &axes)?;
        let values = to_1d_json(&arr, element_type);
        let indices: Vec<u64> = (0..count).map(|i| i * stride).collect();
        let table = serde_json::json!({ "kind": "1d", "columns": ["index", "value"], "index": indices, "values": values });
        let plot = serde_json::json!({ "x": indices, "y": values, "quality_applied": quality });
        return Ok(ExtractionResult::Preview {
            shape: shape.clone(),
            ndim,
            dtype: element_type.dtype_string(),
            display_dims: None,
            fixed_indices: BTreeMap::new(),
            table,
            plot: Some(plot),
        });
    }

    let sel = planner::resolve_selection(&meta, req)?;
    let (d0, d1) = sel.display_dims.expect("ndim >= 2 always resolves display_dims");
    let (plan, effective_max_size, _clamped) =
        planner::plan_heatmap(sel.row_range.1, sel.col_range.1, max_size, PREVIEW_MAX_SIZE);
    let row_count = div_ceil(sel.row_range.1, plan.row_stride);
    let col_count = div_ceil(sel.col_range.1, plan.col_stride);
    check_element_ceiling((row_count as u128) * (col_count as u128), ceiling)?;

    check_cancelled(cancel).await?;
    let axes = build_axes(ndim, &sel, plan.row_stride, plan.col_stride);
    let arr = reshape(read_hyperslab_f64(&dataset, &axes)?, &[row_count as usize, col_count as usize])?;
    let rows = to_2d_json(&arr, element_type);

    let table = serde_json::json!({ "kind": "2d", "rows": rows, "row_step": plan.row_stride, "col_step": plan.col_stride });
    let plot = serde_json::json!({ "display_dims": [d0, d1], "effective_max_size": effective_max_size, "rows": rows });

    Ok(ExtractionResult::Preview {
        shape: shape.clone(),
        ndim,
        dtype: element_type.dtype_string(),
        display_dims: sel.display_dims,
        fixed_indices: sel.fixed_indices,
        table,
        plot: Some(plot),
    })
}

// ---------------------------------------------------------------------------
// Matrix block
// ---------------------------------------------------------------------------

/// Read a contiguous rectangular sub-array with no striding, echoing back
/// effective (possibly clamped) limits. Empty ranges are not errors.
pub async fn matrix_block(
    handle: &ContainerHandle,
    path: &str,
    req: &SelectionRequest,
    ceiling: u64,
    cancel: &CancellationToken,
) -> Result<ExtractionResult> {
    check_cancelled(cancel).await?;
    let (dataset, meta) = open_dataset(handle, path)?;
    let sel = planner::resolve_selection(&meta, req)?;
    let ndim = match &meta {
        NodeMeta::Dataset { ndim, .. } => *ndim,
        NodeMeta::Group { .. } => unreachable!("resolve_selection rejects groups"),
    };
    let element_type = match &meta {
        NodeMeta::Dataset { element_type, .. } => element_type.clone(),
        NodeMeta::Group { .. } => unreachable!(),
    };

    let row_count = sel.row_range.1;
    let col_count = sel.col_range.1;
    check_element_ceiling((row_count as u128) * (col_count as u128).max(1), ceiling)?;

    let data = if row_count == 0 || col_count == 0 {
        Vec::new()
    } else {
        let axes = build_axes(ndim, &sel, 1, 1);
        let arr = reshape(read_hyperslab_f64(&dataset, &axes)?, &[row_count as usize, col_count as usize])?;
        to_2d_json(&arr, &element_type)
    };

    Ok(ExtractionResult::MatrixBlock {
        data,
        row_offset: sel.row_range.0,
        col_offset: sel.col_range.0,
        row_limit: row_count,
        col_limit: col_count,
    })
}

// ---------------------------------------------------------------------------
// Line series
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub async fn line_series(
    handle: &ContainerHandle,
    path: &str,
    line_dim: usize,
    line_index: Option<u64>,
    fixed_indices: BTreeMap<usize, u64>,
    line_offset: u64,
    line_limit: Option<u64>,
    quality: Quality,
    max_points: u64,
    exact_max_points: u64,
    ceiling: u64,
    cancel: &CancellationToken,
) -> Result<ExtractionResult> {
    check_cancelled(cancel).await?;
    let (dataset, meta) = open_dataset(handle, path)?;
    let (shape, resolved_fixed, axis_size) =
        planner::resolve_line_selection(&meta, line_dim, fixed_indices, line_index)?;
    let element_type = match &meta {
        NodeMeta::Dataset { element_type, .. } => element_type.clone(),
        NodeMeta::Group { .. } => unreachable!(),
    };

    if line_offset > axis_size {
        return Err(EngineError::OutOfRange(format!(
            "line_offset {line_offset} exceeds dimension size {axis_size}"
        )));
    }
    let requested_span = line_limit.unwrap_or(axis_size - line_offset);
    let span = requested_span.min(axis_size - line_offset);

    let (stride, quality_applied) = planner::plan_line(span, quality, max_points, exact_max_points)?;
    let returned_points = div_ceil(span, stride);
    check_element_ceiling(returned_points as u128, ceiling)?;

    let mut axes = Vec::with_capacity(shape.len());
    for dim in 0..shape.len() {
        if dim == line_dim {
            axes.push(AxisSlab { start: line_offset, stride, count: returned_points });
        } else {
            axes.push(AxisSlab { start: resolved_fixed[&dim], stride: 1, count: 1 });
        }
    }

    check_cancelled(cancel).await?;
    let arr = reshape(read_hyperslab_f64(&dataset, &axes)?, &[returned_points as usize])?;
    let data = to_1d_json(&arr, &element_type);

    Ok(ExtractionResult::LineSeries {
        data,
        line_offset,
        line_step: stride,
        quality_applied,
        requested_points: requested_span,
        returned_points,
    })
}

// ---------------------------------------------------------------------------
// Heatmap grid
// ---------------------------------------------------------------------------

pub async fn heatmap_grid(
    handle: &ContainerHandle,
    path: &str,
    req: &SelectionRequest,
    max_size: u32,
    heatmap_max_side: u32,
    include_stats: bool,
    ceiling: u64,
    cancel: &CancellationToken,
) -> Result<ExtractionResult> {
    check_cancelled(cancel).await?;
    let (dataset, meta) = open_dataset(handle, path)?;
    let ndim = match &meta {
        NodeMeta::Dataset { ndim, .. } => *ndim,
        NodeMeta::Group { .. } => return Err(EngineError::BadSelection("path is a group".to_string())),
    };
    let element_type = match &meta {
        NodeMeta::Dataset { element_type, .. } => element_type.clone(),
        NodeMeta::Group { .. } => unreachable!(),
    };
    let sel = planner::resolve_selection(&meta, req)?;
    let (plan, effective_max_size, max_size_clamped) =
        planner::plan_heatmap(sel.row_range.1, sel.col_range.1, max_size, heatmap_max_side);

    let row_count = div_ceil(sel.row_range.1, plan.row_stride);
    let col_count = div_ceil(sel.col_range.1, plan.col_stride);
    check_element_ceiling((row_count as u128) * (col_count as u128), ceiling)?;

    check_cancelled(cancel).await?;
    let axes = build_axes(ndim, &sel, plan.row_stride, plan.col_stride);
    let arr = reshape(read_hyperslab_f64(&dataset, &axes)?, &[row_count as usize, col_count as usize])?;
    let data = to_2d_json(&arr, &element_type);

    let stats = if include_stats { Some(compute_stats(&arr)) } else { None };

    Ok(ExtractionResult::HeatmapGrid { data, effective_max_size, max_size_clamped, stats })
}

fn compute_stats(arr: &ArrayD<f64>) -> Stats {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut count = 0u64;
    for &v in arr.iter() {
        if !v.is_finite() {
            continue;
        }
        min = min.min(v);
        max = max.max(v);
        sum += v;
        count += 1;
    }
    let mean = if count > 0 { sum / count as f64 } else { 0.0 };
    let mut var_sum = 0.0;
    for &v in arr.iter() {
        if v.is_finite() {
            var_sum += (v - mean) * (v - mean);
        }
    }
    let std = if count > 0 { (var_sum / count as f64).sqrt() } else { 0.0 };
    if count == 0 {
        Stats { min: 0.0, max: 0.0, mean: 0.0, std: 0.0 }
    } else {
        Stats { min, max, mean, std }
    }
}

// ---------------------------------------------------------------------------
// CSV export
// ---------------------------------------------------------------------------

const CSV_ROW_BATCH: u64 = 256;

/// Cursor over a full (unstrided) selection, yielding CSV text in row
/// batches so a caller can stream it without holding the whole selection
/// in memory at once.
pub struct CsvCursor {
    handle: Arc<ContainerHandle>,
    path: String,
    element_type: ElementType,
    ndim: usize,
    sel: Selection,
    next_row: u64,
    total_rows: u64,
    is_1d: bool,
}

impl CsvCursor {
    pub fn header(&self) -> String {
        if self.is_1d {
            "index,value".to_string()
        } else {
            let (_, col_offset, col_limit) = (0u64, self.sel.col_range.0, self.sel.col_range.1);
            let cols: Vec<String> = (col_offset..col_offset + col_limit).map(|c| c.to_string()).collect();
            format!("row\\col,{}", cols.join(","))
        }
    }

    /// Produce the next batch of CSV rows (`None` once exhausted).
    pub async fn next_batch(&mut self, cancel: &CancellationToken) -> Result<Option<Vec<String>>> {
        check_cancelled(cancel).await?;
        if self.next_row >= self.total_rows {
            return Ok(None);
        }
        let batch_rows = CSV_ROW_BATCH.min(self.total_rows - self.next_row);

        let (dataset, _meta) = open_dataset(&self.handle, &self.path)?;
        let mut batch_sel = self.sel.clone();
        batch_sel.row_range = (self.sel.row_range.0 + self.next_row, batch_rows);

        let rows = if self.is_1d {
            let axes = vec![AxisSlab { start: batch_sel.row_range.0, stride: 1, count: batch_rows }];
            let arr = reshape(read_hyperslab_f64(&dataset, &axes)?, &[batch_rows as usize])?;
            arr.iter()
                .enumerate()
                .map(|(i, &v)| {
                    let idx = batch_sel.row_range.0 + i as u64;
                    format!("{idx},{}", value_to_json(v, &self.element_type))
                })
                .collect()
        } else {
            let axes = build_axes(self.ndim, &batch_sel, 1, 1);
            let arr = reshape(
                read_hyperslab_f64(&dataset, &axes)?,
                &[batch_rows as usize, self.sel.col_range.1 as usize],
            )?;
            arr.rows()
                .into_iter()
                .enumerate()
                .map(|(i, row)| {
                    let row_idx = batch_sel.row_range.0 + i as u64;
                    let cells: Vec<String> =
                        row.iter().map(|&v| value_to_json(v, &self.element_type).to_string()).collect();
                    format!("{row_idx},{}", cells.join(","))
                })
                .collect()
        };

        self.next_row += batch_rows;
        Ok(Some(rows))
    }
}

pub fn csv_export(
    handle: Arc<ContainerHandle>,
    path: &str,
    meta: &NodeMeta,
    req: &SelectionRequest,
) -> Result<CsvCursor> {
    let sel = planner::resolve_selection(meta, req)?;
    let (ndim, element_type) = match meta {
        NodeMeta::Dataset { ndim, element_type, .. } => (*ndim, element_type.clone()),
        NodeMeta::Group { .. } => return Err(EngineError::BadSelection("path is a group".to_string())),
    };
    let is_1d = sel.display_dims.is_none();
    let total_rows = sel.row_range.1;

    Ok(CsvCursor { handle, path: path.to_string(), element_type, ndim, sel, next_row: 0, total_rows, is_1d })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalFsAdapter;
    use std::sync::Arc;

    fn write_fixture(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("sample.h5");
        let file = hdf5::File::create(&path).unwrap();
        let data: Vec<f64> = (0..200).map(|i| i as f64).collect();
        file.new_dataset::<f64>().shape((20, 10)).create("Grid").unwrap().write_raw(&data).unwrap();
        path
    }

    async fn open_handle(dir: &std::path::Path) -> Arc<ContainerHandle> {
        let adapter = LocalFsAdapter::new(dir).unwrap();
        let pool = crate::pool::ReaderPool::new(Arc::new(adapter), 4);
        pool.acquire("sample.h5", &CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn preview_observes_a_cancellation_requested_before_any_read() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let handle = open_handle(dir.path()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = preview(&handle, "/Grid", &SelectionRequest::default(), None, 25_000_000, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
    }

    #[tokio::test]
    async fn matrix_block_observes_a_cancellation_requested_before_any_read() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let handle = open_handle(dir.path()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let req = SelectionRequest {
            row_range: Some((0, 20)),
            col_range: Some((0, 10)),
            ..Default::default()
        };
        let err = matrix_block(&handle, "/Grid", &req, 25_000_000, &cancel).await.unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
    }

    #[tokio::test]
    async fn matrix_block_reads_the_requested_rectangle() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let handle = open_handle(dir.path()).await;

        let req = SelectionRequest {
            row_range: Some((2, 3)),
            col_range: Some((1, 4)),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let result = matrix_block(&handle, "/Grid", &req, 25_000_000, &cancel).await.unwrap();
        match result {
            ExtractionResult::MatrixBlock { data, row_offset, col_offset, row_limit, col_limit } => {
                assert_eq!((row_offset, col_offset, row_limit, col_limit), (2, 1, 3, 3));
                assert_eq!(data.len(), 3);
                assert_eq!(data[0].len(), 3);
                // row 2 of a row-major 20x10 grid starts at element 20; col offset 1.
                assert_eq!(data[0][0], serde_json::json!(21.0));
            }
            other => panic!("expected MatrixBlock, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn element_ceiling_rejects_oversized_selection_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let handle = open_handle(dir.path()).await;

        let req = SelectionRequest::default();
        let cancel = CancellationToken::new();
        let err = matrix_block(&handle, "/Grid", &req, 10, &cancel).await.unwrap_err();
        assert_eq!(err.code(), "RANGE_TOO_LARGE");
    }
}
