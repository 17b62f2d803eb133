//! Value types shared across the engine: storage objects, node metadata,
//! element types, shapes, selections, and extraction results.
//!
//! These are plain data — copied freely, never holding locks or file
//! handles. Anything that owns a resource (a container handle, a storage
//! stream) lives in `pool` or `storage` instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An object discovered by a storage adapter's `list()`.
#[derive(Debug, Clone, Serialize)]
pub struct StorageObject {
    pub key: String,
    pub size: u64,
    pub last_modified_unix_ms: i64,
    pub etag: String,
}

/// Result of a non-recursive `list()` call: virtual folders plus files.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Listing {
    pub folders: Vec<String>,
    pub files: Vec<StorageObject>,
}

/// Kind of node inside a container: a named group of children, or a leaf
/// array dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Group,
    Dataset,
}

/// One child reported by the hierarchy walker's `children()`.
#[derive(Debug, Clone, Serialize)]
pub struct Child {
    pub name: String,
    pub path: String,
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
}

/// Byte order of a numeric element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

/// The element type classified richly enough to drive decoding and display.
///
/// Tagged union with one variant per storage representation; `extract.rs`
/// matches on it to decide whether a dataset can be decoded numerically at
/// all (`is_numeric_plottable`) and what dtype string to report.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "class")]
pub enum ElementType {
    Integer {
        signed: bool,
        #[serde(rename = "size")]
        bits: u8,
        order: ByteOrder,
    },
    Float {
        #[serde(rename = "size")]
        bits: u8,
        order: ByteOrder,
    },
    Boolean,
    FixedString { byte_len: usize, encoding: String },
    VarString,
    Compound { fields: Vec<(String, String)> },
    Opaque,
}

impl ElementType {
    /// `numeric-plottable` iff integer | float | boolean.
    pub fn is_numeric_plottable(&self) -> bool {
        matches!(self, ElementType::Integer { .. } | ElementType::Float { .. } | ElementType::Boolean)
    }

    /// Short dtype string, e.g. `"int32"`, `"float64"`, `"bool"`.
    pub fn dtype_string(&self) -> String {
        match self {
            ElementType::Integer { signed, bits, .. } => {
                format!("{}{}", if *signed { "int" } else { "uint" }, bits)
            }
            ElementType::Float { bits, .. } => format!("float{bits}"),
            ElementType::Boolean => "bool".to_string(),
            ElementType::FixedString { byte_len, .. } => format!("string{byte_len}"),
            ElementType::VarString => "vstring".to_string(),
            ElementType::Compound { .. } => "compound".to_string(),
            ElementType::Opaque => "opaque".to_string(),
        }
    }
}

/// Ordered, non-negative dimension sizes. Length is `ndim`.
pub type Shape = Vec<u64>;

/// Total element count for a shape, saturating rather than wrapping on
/// overflow — callers compare this against `limits.max_extract_elements`
/// before it is ever used as an allocation size.
pub fn element_count(shape: &[u64]) -> u128 {
    shape.iter().fold(1u128, |acc, &d| acc.saturating_mul(d as u128))
}

/// One compression/filter entry, ordered as stored.
#[derive(Debug, Clone, Serialize)]
pub struct FilterInfo {
    pub name: String,
    pub id: i32,
    pub options: Vec<u32>,
}

/// One attribute, with a small-value inline or elided when oversized.
#[derive(Debug, Clone, Serialize)]
pub struct AttributeInfo {
    pub name: String,
    pub dtype: String,
    pub shape: Shape,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Full metadata for one node, returned by the hierarchy walker's `meta()`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeMeta {
    Group {
        path: String,
        child_count: usize,
        attributes: Vec<AttributeInfo>,
    },
    Dataset {
        path: String,
        shape: Shape,
        ndim: usize,
        size: u128,
        dtype: String,
        #[serde(rename = "type")]
        element_type: ElementType,
        chunks: Option<Shape>,
        compression: Option<(String, u32)>,
        filters: Vec<FilterInfo>,
        attributes: Vec<AttributeInfo>,
    },
}

/// Requested display-dims + fixed-indices + range parameters, resolved
/// against a dataset's rank by the slice planner.
#[derive(Debug, Clone, Default)]
pub struct SelectionRequest {
    pub display_dims: Option<(usize, usize)>,
    pub fixed_indices: BTreeMap<usize, u64>,
    pub row_range: Option<(u64, u64)>,
    pub col_range: Option<(u64, u64)>,
}

/// A fully resolved selection: every non-display dimension has a concrete
/// index, and ranges are clamped into bounds. Produced by the slice
/// planner, consumed by the extraction engine.
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub display_dims: Option<(usize, usize)>,
    pub fixed_indices: BTreeMap<usize, u64>,
    pub row_range: (u64, u64),
    pub col_range: (u64, u64),
}

/// Per-axis integer strides chosen so a read fits within a size budget.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DownsamplePlan {
    pub row_stride: u64,
    pub col_stride: u64,
}

impl DownsamplePlan {
    pub const NONE: DownsamplePlan = DownsamplePlan { row_stride: 1, col_stride: 1 };
}

/// Requested quality for line-series extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Exact,
    Overview,
    Auto,
}

/// `{min, max, mean, std}` summary stats, attached to heatmaps on request.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

/// One of the four extraction result shapes the engine can produce.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ExtractionResult {
    Preview {
        shape: Shape,
        ndim: usize,
        dtype: String,
        display_dims: Option<(usize, usize)>,
        fixed_indices: BTreeMap<usize, u64>,
        table: serde_json::Value,
        plot: Option<serde_json::Value>,
    },
    MatrixBlock {
        data: Vec<Vec<serde_json::Value>>,
        row_offset: u64,
        col_offset: u64,
        row_limit: u64,
        col_limit: u64,
    },
    LineSeries {
        data: Vec<serde_json::Value>,
        line_offset: u64,
        line_step: u64,
        quality_applied: Quality,
        requested_points: u64,
        returned_points: u64,
    },
    HeatmapGrid {
        data: Vec<Vec<serde_json::Value>>,
        effective_max_size: u32,
        max_size_clamped: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        stats: Option<Stats>,
    },
}
