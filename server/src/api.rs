//! HTTP API handlers for the HDF5 data-access engine.
//!
//! Every handler binds a cancellation token via the lifecycle gate before
//! touching the engine, translates query parameters into the core's
//! request types, and lets `?` propagate `h5gate_core::EngineError` through
//! `ApiError`'s `IntoResponse`. None of the engine logic lives here — this
//! module is wiring, the way the spec calls for a thin HTTP shell.

use crate::error::{ApiError, ApiResult};
use crate::types::AppContext;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use h5gate_core::error::EngineError;
use h5gate_core::model::{NodeMeta, Quality, SelectionRequest};
use h5gate_core::pool::ContainerHandle;
use h5gate_core::{extract, fingerprint, hierarchy};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Acquire a container handle, retrying exactly once if the freshness token
/// moved between the probe and the open (`EngineError::Stale`) — the pool's
/// own `acquire` re-probes freshness on every call, so a second attempt picks
/// up whatever token is now current. A second `Stale` surfaces to the client
/// rather than retrying indefinitely.
async fn acquire_handle(
    ctx: &AppContext,
    key: &str,
    cancel: &CancellationToken,
) -> Result<Arc<ContainerHandle>, EngineError> {
    match ctx.readers.acquire(key, cancel).await {
        Err(EngineError::Stale) => ctx.readers.acquire(key, cancel).await,
        other => other,
    }
}

/// `etag=` is a freshness hint the client attaches from a previously seen
/// response. If it no longer matches the handle's current token, the
/// client's view of the file is stale: surface `Stale` once rather than
/// silently answering with data computed under a token the caller didn't
/// ask for. The caller is expected to retry without (or with an updated)
/// `etag=` and receive a fresh payload.
fn check_etag_freshness(etag: &Option<String>, handle: &ContainerHandle) -> Result<(), EngineError> {
    match etag {
        Some(e) if e != &handle.token => Err(EngineError::Stale),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Shared parameter parsing
// ---------------------------------------------------------------------------

fn parse_display_dims(raw: &str) -> ApiResult<(usize, usize)> {
    let (a, b) = raw.split_once(',').ok_or_else(|| {
        ApiError(EngineError::BadSelection(format!("display_dims {raw:?} must be \"d0,d1\"")))
    })?;
    let d0: usize = a.trim().parse().map_err(|_| {
        ApiError(EngineError::BadSelection(format!("display_dims {raw:?} is not numeric")))
    })?;
    let d1: usize = b.trim().parse().map_err(|_| {
        ApiError(EngineError::BadSelection(format!("display_dims {raw:?} is not numeric")))
    })?;
    Ok((d0, d1))
}

fn parse_fixed_indices(raw: &str) -> ApiResult<BTreeMap<usize, u64>> {
    let mut out = BTreeMap::new();
    for part in raw.split(',').filter(|p| !p.is_empty()) {
        let (dim, idx) = part.split_once('=').ok_or_else(|| {
            ApiError(EngineError::BadSelection(format!(
                "fixed_indices entry {part:?} must be \"dim=index\""
            )))
        })?;
        let dim: usize = dim.trim().parse().map_err(|_| {
            ApiError(EngineError::BadSelection(format!("fixed_indices dim {dim:?} is not numeric")))
        })?;
        let idx: u64 = idx.trim().parse().map_err(|_| {
            ApiError(EngineError::BadSelection(format!("fixed_indices index {idx:?} is not numeric")))
        })?;
        out.insert(dim, idx);
    }
    Ok(out)
}

fn selection_request(
    display_dims: &Option<String>,
    fixed_indices: &Option<String>,
    row_offset: Option<u64>,
    row_limit: Option<u64>,
    col_offset: Option<u64>,
    col_limit: Option<u64>,
) -> ApiResult<SelectionRequest> {
    Ok(SelectionRequest {
        display_dims: display_dims.as_deref().map(parse_display_dims).transpose()?,
        fixed_indices: fixed_indices.as_deref().map(parse_fixed_indices).transpose()?.unwrap_or_default(),
        row_range: row_offset.zip(row_limit),
        col_range: col_offset.zip(col_limit),
    })
}

fn normalize_path(path: &Option<String>) -> String {
    match path {
        None => "/".to_string(),
        Some(p) if p.is_empty() => "/".to_string(),
        Some(p) => p.clone(),
    }
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub async fn health(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "status": "ok",
        "uptime_seconds": ctx.start_time.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// GET /files
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct FilesQuery {
    #[serde(default)]
    pub prefix: String,
    pub bucket: Option<String>,
    pub source: Option<String>,
}

pub async fn list_files(
    State(ctx): State<AppContext>,
    Query(q): Query<FilesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let source = q.source.or(q.bucket).unwrap_or_else(|| "default".to_string());
    let key = (q.prefix.clone(), source);
    let listing = ctx
        .listing_cache
        .get_or_compute(key, "static", || async { ctx.readers.storage().list(&q.prefix, "/").await })
        .await?;
    Ok(Json(json!({ "success": true, "folders": listing.folders, "files": listing.files })))
}

// ---------------------------------------------------------------------------
// POST /files/refresh
// ---------------------------------------------------------------------------

pub async fn refresh(State(ctx): State<AppContext>) -> impl IntoResponse {
    ctx.listing_cache.clear();
    ctx.meta_cache.clear();
    Json(json!({ "success": true }))
}

// ---------------------------------------------------------------------------
// GET /files/{key}/children
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct PathQuery {
    pub path: Option<String>,
    pub etag: Option<String>,
}

pub async fn children(
    State(ctx): State<AppContext>,
    Path(key): Path<String>,
    Query(q): Query<PathQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let guard = ctx.lifecycle.begin(None).await?;
    let handle = acquire_handle(&ctx, &key, &guard.cancel).await?;
    check_etag_freshness(&q.etag, &handle)?;
    let path = normalize_path(&q.path);

    let meta_key = (key.clone(), format!("children:{path}"));
    let out = ctx
        .meta_cache
        .get_or_compute(meta_key, &handle.token, || async {
            let children = hierarchy::children(&handle, &path)?;
            Ok(json!({ "success": true, "children": children }))
        })
        .await?;
    ctx.lifecycle.finish(None, &guard);
    Ok(Json(out))
}

// ---------------------------------------------------------------------------
// GET /files/{key}/meta
// ---------------------------------------------------------------------------

pub async fn meta(
    State(ctx): State<AppContext>,
    Path(key): Path<String>,
    Query(q): Query<PathQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let guard = ctx.lifecycle.begin(None).await?;
    let handle = acquire_handle(&ctx, &key, &guard.cancel).await?;
    check_etag_freshness(&q.etag, &handle)?;
    let path = normalize_path(&q.path);

    let meta_key = (key.clone(), format!("meta:{path}"));
    let out = ctx
        .meta_cache
        .get_or_compute(meta_key, &handle.token, || async {
            let node = hierarchy::meta(&handle, &path)?;
            Ok(json!({ "success": true, "node": node }))
        })
        .await?;
    ctx.lifecycle.finish(None, &guard);
    Ok(Json(out))
}

// ---------------------------------------------------------------------------
// GET /files/{key}/preview
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct PreviewQuery {
    pub path: String,
    pub display_dims: Option<String>,
    pub fixed_indices: Option<String>,
    pub max_size: Option<u32>,
    pub etag: Option<String>,
}

pub async fn preview(
    State(ctx): State<AppContext>,
    Path(key): Path<String>,
    Query(q): Query<PreviewQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let guard = ctx.lifecycle.begin(None).await?;
    let handle = acquire_handle(&ctx, &key, &guard.cancel).await?;
    check_etag_freshness(&q.etag, &handle)?;
    let req = selection_request(&q.display_dims, &q.fixed_indices, None, None, None, None)?;

    let fp = fingerprint::preview(&q.path, &req, q.max_size);
    let meta_key = (key.clone(), fp);
    let ceiling = ctx.limits.max_extract_elements;
    let out = ctx
        .meta_cache
        .get_or_compute(meta_key, &handle.token, || async {
            let result = extract::preview(&handle, &q.path, &req, q.max_size, ceiling, &guard.cancel).await?;
            Ok(serde_json::to_value(&result).expect("ExtractionResult always serializes"))
        })
        .await?;
    ctx.lifecycle.finish(None, &guard);
    Ok(Json(json!({ "success": true, "result": out })))
}

// ---------------------------------------------------------------------------
// GET /files/{key}/data
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct DataQuery {
    pub path: String,
    pub mode: String,
    pub row_offset: Option<u64>,
    pub row_limit: Option<u64>,
    pub col_offset: Option<u64>,
    pub col_limit: Option<u64>,
    pub line_dim: Option<usize>,
    pub line_index: Option<u64>,
    pub line_offset: Option<u64>,
    pub line_limit: Option<u64>,
    pub quality: Option<String>,
    pub max_points: Option<u64>,
    pub max_size: Option<u32>,
    pub include_stats: Option<bool>,
    pub display_dims: Option<String>,
    pub fixed_indices: Option<String>,
    pub etag: Option<String>,
    pub cancel_key: Option<String>,
}

fn parse_quality(s: &Option<String>) -> Quality {
    match s.as_deref() {
        Some("exact") => Quality::Exact,
        Some("overview") => Quality::Overview,
        _ => Quality::Auto,
    }
}

pub async fn data(
    State(ctx): State<AppContext>,
    Path(key): Path<String>,
    Query(q): Query<DataQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let guard = ctx.lifecycle.begin(q.cancel_key.as_deref()).await?;
    let handle = acquire_handle(&ctx, &key, &guard.cancel).await?;
    check_etag_freshness(&q.etag, &handle)?;
    let ceiling = ctx.limits.max_extract_elements;
    let req = selection_request(
        &q.display_dims,
        &q.fixed_indices,
        q.row_offset,
        q.row_limit,
        q.col_offset,
        q.col_limit,
    )?;

    let result = match q.mode.as_str() {
        "matrix" => {
            let fp = fingerprint::matrix(
                &q.path,
                &req,
                q.row_offset.unwrap_or(0),
                q.row_limit.unwrap_or(u64::MAX),
                q.col_offset.unwrap_or(0),
                q.col_limit.unwrap_or(u64::MAX),
            );
            let meta_key = (key.clone(), fp);
            ctx.meta_cache
                .get_or_compute(meta_key, &handle.token, || async {
                    let r = extract::matrix_block(&handle, &q.path, &req, ceiling, &guard.cancel).await?;
                    Ok(serde_json::to_value(&r).expect("ExtractionResult always serializes"))
                })
                .await?
        }
        "line" => {
            let quality = parse_quality(&q.quality);
            let max_points = q.max_points.unwrap_or(1000);
            // `line_dim` is optional on the wire (spec.md S6): the common
            // case is a 1-D dataset, where dim 0 is the only sensible axis.
            let line_dim = q.line_dim.unwrap_or(0);
            let fp = fingerprint::line(
                &q.path,
                &req,
                line_dim,
                q.line_index.unwrap_or(0),
                q.line_offset.unwrap_or(0),
                q.line_limit.unwrap_or(0),
                quality,
                max_points,
            );
            let meta_key = (key.clone(), fp);
            ctx.meta_cache
                .get_or_compute(meta_key, &handle.token, || async {
                    let r = extract::line_series(
                        &handle,
                        &q.path,
                        line_dim,
                        q.line_index,
                        req.fixed_indices.clone(),
                        q.line_offset.unwrap_or(0),
                        q.line_limit,
                        quality,
                        max_points,
                        ctx.limits.exact_line_points,
                        ceiling,
                        &guard.cancel,
                    )
                    .await?;
                    Ok(serde_json::to_value(&r).expect("ExtractionResult always serializes"))
                })
                .await?
        }
        "heatmap" => {
            let max_size = q.max_size.unwrap_or(512);
            let include_stats = q.include_stats.unwrap_or(false);
            let fp = fingerprint::heatmap(&q.path, &req, max_size, include_stats);
            let meta_key = (key.clone(), fp);
            let heatmap_max_side = ctx.limits.heatmap_max_side;
            ctx.meta_cache
                .get_or_compute(meta_key, &handle.token, || async {
                    let r = extract::heatmap_grid(
                        &handle,
                        &q.path,
                        &req,
                        max_size,
                        heatmap_max_side,
                        include_stats,
                        ceiling,
                        &guard.cancel,
                    )
                    .await?;
                    Ok(serde_json::to_value(&r).expect("ExtractionResult always serializes"))
                })
                .await?
        }
        other => {
            return Err(ApiError(EngineError::BadSelection(format!(
                "mode must be matrix, line, or heatmap, got {other:?}"
            ))))
        }
    };

    ctx.lifecycle.finish(q.cancel_key.as_deref(), &guard);
    Ok(Json(json!({ "success": true, "result": result })))
}

// ---------------------------------------------------------------------------
// GET /files/{key}/export/csv
// ---------------------------------------------------------------------------

pub async fn export_csv(
    State(ctx): State<AppContext>,
    Path(key): Path<String>,
    Query(q): Query<DataQuery>,
) -> Result<Response, ApiError> {
    let guard = ctx.lifecycle.begin(q.cancel_key.as_deref()).await?;
    let handle = acquire_handle(&ctx, &key, &guard.cancel).await?;
    check_etag_freshness(&q.etag, &handle)?;
    let req = selection_request(
        &q.display_dims,
        &q.fixed_indices,
        q.row_offset,
        q.row_limit,
        q.col_offset,
        q.col_limit,
    )?;
    let node_meta: NodeMeta = hierarchy::meta(&handle, &q.path)?;
    let cursor = extract::csv_export(handle, &q.path, &node_meta, &req)?;
    let header = cursor.header();

    let cancel = guard.cancel.clone();
    // `done` latches true once either the cursor is exhausted or a read
    // fails, so the stream always terminates cleanly instead of looping on
    // a persistent error.
    let rows = futures::stream::unfold((cursor, false), move |(mut cursor, done)| {
        let cancel = cancel.clone();
        async move {
            if done {
                return None;
            }
            match cursor.next_batch(&cancel).await {
                Ok(Some(rows)) => Some((Ok::<_, std::io::Error>(rows.join("\n") + "\n"), (cursor, false))),
                Ok(None) => None,
                Err(e) => Some((Err(std::io::Error::other(e.to_string())), (cursor, true))),
            }
        }
    });

    let body_stream =
        futures::stream::once(async move { Ok::<_, std::io::Error>(format!("{header}\n")) }).chain(rows);

    let body = Body::from_stream(body_stream);
    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/csv")
        .body(body)
        .expect("static header values are always valid");

    // The lifecycle guard and cancel-key registration are released when
    // `guard` drops at the end of this function; the streamed body keeps
    // its own cloned cancellation token alive for as long as the client is
    // still reading.
    drop(guard);
    Ok(response)
}
