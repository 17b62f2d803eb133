//! Thin translation layer between `hdf5` crate types and this engine's
//! value types (`model::ElementType`, `model::NodeMeta`, ...), plus the
//! one hyperslab-read helper every extraction path shares.
//!
//! `element_type_of` classifies a `hdf5::Datatype` into our tagged
//! `ElementType`, and `read_hyperslab_f64` is the single "decode-block"
//! primitive every mode builds on — the HDF5 library performs the
//! int/float -> f64 conversion during the read itself, so the engine never
//! hand-rolls per-width decoders.

use crate::error::{EngineError, Result};
use crate::model::{ByteOrder, ElementType, Shape};
use hdf5::types::TypeDescriptor;
use ndarray::ArrayD;

/// Classify a dataset's `Datatype` into our richer `ElementType`.
///
/// Byte order reflects the host's native order: `hdf5` transparently
/// converts stored byte order to native during every read, so there is no
/// "storage order" left to observe once the crate's safe API is in use.
pub fn element_type_of(dtype: &hdf5::Datatype) -> Result<ElementType> {
    let native_order =
        if cfg!(target_endian = "big") { ByteOrder::Big } else { ByteOrder::Little };
    let descriptor = dtype
        .to_descriptor()
        .map_err(|e| EngineError::CorruptContainer(format!("unreadable dtype: {e}")))?;

    Ok(match descriptor {
        TypeDescriptor::Integer(size) => {
            ElementType::Integer { signed: true, bits: (size as u8) * 8, order: native_order }
        }
        TypeDescriptor::Unsigned(size) => {
            ElementType::Integer { signed: false, bits: (size as u8) * 8, order: native_order }
        }
        TypeDescriptor::Float(size) => ElementType::Float { bits: (size as u8) * 8, order: native_order },
        TypeDescriptor::Boolean => ElementType::Boolean,
        TypeDescriptor::FixedAscii(len) => {
            ElementType::FixedString { byte_len: len, encoding: "ascii".to_string() }
        }
        TypeDescriptor::FixedUnicode(len) => {
            ElementType::FixedString { byte_len: len, encoding: "utf-8".to_string() }
        }
        TypeDescriptor::VarLenAscii | TypeDescriptor::VarLenUnicode => ElementType::VarString,
        TypeDescriptor::Compound(c) => ElementType::Compound {
            fields: c.fields.iter().map(|f| (f.name.clone(), format!("{:?}", f.ty))).collect(),
        },
        _ => ElementType::Opaque,
    })
}

/// Per-axis hyperslab description: start offset, stride, and element count
/// along that axis. `stride = 1` reads every element in `[start, start +
/// count)`.
#[derive(Debug, Clone, Copy)]
pub struct AxisSlab {
    pub start: u64,
    pub stride: u64,
    pub count: u64,
}

/// Read a hyperslab from `dataset` as `f64`, regardless of the dataset's
/// stored numeric type — HDF5 performs the type conversion as part of the
/// read. Not valid for non-numeric element types; callers must reject
/// those earlier (`EngineError::UnsupportedElementType`).
pub fn read_hyperslab_f64(dataset: &hdf5::Dataset, axes: &[AxisSlab]) -> Result<ArrayD<f64>> {
    let selection: Vec<hdf5::SliceOrIndex> = axes
        .iter()
        .map(|a| hdf5::SliceOrIndex::SliceCount {
            start: a.start as isize,
            step: a.stride as isize,
            count: a.count as isize,
            block: 1,
        })
        .collect();
    let hyperslab = hdf5::Hyperslab::from(selection);
    dataset
        .read_slice::<f64, _, ndarray::IxDyn>(hyperslab)
        .map_err(|e| EngineError::CorruptContainer(format!("hyperslab read: {e}")))
}

/// Convert one read value into a JSON number, rounding to an integer when
/// the element type is integral (values beyond 2^53 in magnitude lose
/// precision through the f64 round-trip — an accepted limitation for a
/// plotting/preview viewer, recorded in DESIGN.md).
pub fn value_to_json(v: f64, element_type: &ElementType) -> serde_json::Value {
    match element_type {
        ElementType::Boolean => serde_json::Value::Bool(v != 0.0),
        ElementType::Integer { .. } if v.is_finite() => {
            serde_json::Number::from_f64(v.round())
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null)
        }
        _ => serde_json::Number::from_f64(v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
    }
}

/// `hdf5::Dataset::shape()` returns `Vec<usize>`; the rest of the engine
/// works in `u64` so sizes compose safely with storage offsets.
pub fn shape_of(dataset: &hdf5::Dataset) -> Shape {
    dataset.shape().into_iter().map(|d| d as u64).collect()
}
