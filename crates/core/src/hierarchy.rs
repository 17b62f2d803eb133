//! C4 — Hierarchy Walker.
//!
//! `children()` lists the one-level contents of a Group; `meta()` returns
//! full metadata for any node. Both operate on an already-acquired
//! `ContainerHandle` and never touch storage or the caches themselves —
//! callers (the HTTP layer, via the cache) are responsible for memoizing.

use crate::error::{EngineError, Result};
use crate::hdf5util::{element_type_of, shape_of};
use crate::model::{AttributeInfo, Child, FilterInfo, NodeKind, NodeMeta};
use crate::pool::ContainerHandle;

/// Attribute values larger than this many bytes are elided to type+shape
/// only.
const MAX_ATTRIBUTE_VALUE_BYTES: usize = 4096;

/// List the one-level children of the Group at `path`. Ordering is stable
/// lexicographic by name, independent of on-disk link-creation order.
/// Requesting `children` on a Dataset is an error.
pub fn children(handle: &ContainerHandle, path: &str) -> Result<Vec<Child>> {
    handle.with_file(|file| {
        let group = open_group(file, path)?;
        let mut names =
            group.member_names().map_err(|e| EngineError::CorruptContainer(e.to_string()))?;
        names.sort();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let child_path = join_path(path, &name);
            if let Ok(dataset) = group.dataset(&name) {
                let dtype = dataset
                    .dtype()
                    .map_err(|e| EngineError::CorruptContainer(e.to_string()))?;
                let element_type = element_type_of(&dtype)?;
                out.push(Child {
                    name,
                    path: child_path,
                    kind: NodeKind::Dataset,
                    shape: Some(shape_of(&dataset)),
                    dtype: Some(element_type.dtype_string()),
                    chunks: dataset.chunk().map(|c| c.into_iter().map(|d| d as u64).collect()),
                    compression: compression_name(&dataset),
                });
            } else if group.group(&name).is_ok() {
                out.push(Child {
                    name,
                    path: child_path,
                    kind: NodeKind::Group,
                    shape: None,
                    dtype: None,
                    chunks: None,
                    compression: None,
                });
            }
            // Anything that's neither (a committed datatype, a soft/external
            // link we chose not to follow) is silently skipped — it is not
            // addressable as a Node per the data model.
        }
        Ok(out)
    })
}

/// Full metadata for the node at `path`.
pub fn meta(handle: &ContainerHandle, path: &str) -> Result<NodeMeta> {
    handle.with_file(|file| {
        if let Ok(dataset) = open_dataset(file, path) {
            let shape = shape_of(&dataset);
            let ndim = shape.len();
            let size = crate::model::element_count(&shape);
            let dtype = dataset.dtype().map_err(|e| EngineError::CorruptContainer(e.to_string()))?;
            let element_type = element_type_of(&dtype)?;
            let dtype_string = element_type.dtype_string();
            let chunks = dataset.chunk().map(|c| c.into_iter().map(|d| d as u64).collect());
            let compression = compression_info(&dataset);
            let filters = filters_of(&dataset);
            let attributes = read_attributes(&dataset)?;

            return Ok(NodeMeta::Dataset {
                path: path.to_string(),
                shape,
                ndim,
                size,
                dtype: dtype_string,
                element_type,
                chunks,
                compression,
                filters,
                attributes,
            });
        }

        let group = open_group(file, path)?;
        let child_count =
            group.member_names().map_err(|e| EngineError::CorruptContainer(e.to_string()))?.len();
        let attributes = read_attributes(&group)?;
        Ok(NodeMeta::Group { path: path.to_string(), child_count, attributes })
    })
}

fn open_group(file: &hdf5::File, path: &str) -> Result<hdf5::Group> {
    let gpath = if path.is_empty() { "/" } else { path };
    file.group(gpath).map_err(|_| EngineError::NotFound(path.to_string()))
}

fn open_dataset(file: &hdf5::File, path: &str) -> Result<hdf5::Dataset> {
    if path == "/" || path.is_empty() {
        return Err(EngineError::NotFound("root is a group".to_string()));
    }
    file.dataset(path.trim_start_matches('/')).map_err(|_| EngineError::NotFound(path.to_string()))
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

/// `hdf5::Dataset::filters()` doesn't expose a single "the" compressor
/// name directly; gzip is overwhelmingly the common case for scientific
/// containers, so it is reported by name when present.
fn compression_name(dataset: &hdf5::Dataset) -> Option<String> {
    if dataset.filters().gzip().is_some() {
        Some("gzip".to_string())
    } else if dataset.filters().szip().is_some() {
        Some("szip".to_string())
    } else {
        None
    }
}

/// Name plus the container's actual compression level — `gzip()` reports
/// the real level the dataset was written with; `szip()` has no equivalent
/// single knob, so its pixels-per-block parameter is reported in that slot.
fn compression_info(dataset: &hdf5::Dataset) -> Option<(String, u32)> {
    let filters = dataset.filters();
    if let Some(level) = filters.gzip() {
        return Some(("gzip".to_string(), level as u32));
    }
    if let Some((_, pixels_per_block)) = filters.szip() {
        return Some(("szip".to_string(), pixels_per_block as u32));
    }
    None
}

fn filters_of(dataset: &hdf5::Dataset) -> Vec<FilterInfo> {
    let filters = dataset.filters();
    let mut out = Vec::new();
    if let Some(level) = filters.gzip() {
        out.push(FilterInfo { name: "gzip".to_string(), id: 1, options: vec![level as u32] });
    }
    if filters.shuffle() {
        out.push(FilterInfo { name: "shuffle".to_string(), id: 2, options: vec![] });
    }
    if filters.fletcher32() {
        out.push(FilterInfo { name: "fletcher32".to_string(), id: 3, options: vec![] });
    }
    out
}

fn read_attributes(location: &impl hdf5::Location) -> Result<Vec<AttributeInfo>> {
    let names = location.attr_names().map_err(|e| EngineError::CorruptContainer(e.to_string()))?;
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let attr = match location.attr(&name) {
            Ok(a) => a,
            Err(_) => continue,
        };
        let dtype = attr.dtype().map_err(|e| EngineError::CorruptContainer(e.to_string()))?;
        let element_type = element_type_of(&dtype)?;
        let shape: Vec<u64> = attr.shape().into_iter().map(|d| d as u64).collect();
        let byte_estimate = crate::model::element_count(&shape) as usize
            * (element_type_bits(&element_type) / 8).max(1);

        let value = if byte_estimate <= MAX_ATTRIBUTE_VALUE_BYTES {
            attr.read_raw::<f64>().ok().map(|v| serde_json::json!(v))
        } else {
            None
        };

        out.push(AttributeInfo { name, dtype: element_type.dtype_string(), shape, value });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

fn element_type_bits(et: &crate::model::ElementType) -> usize {
    use crate::model::ElementType::*;
    match et {
        Integer { bits, .. } | Float { bits, .. } => *bits as usize,
        Boolean => 8,
        _ => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalFsAdapter;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn fixture_handle(dir: &std::path::Path) -> Arc<ContainerHandle> {
        let path = dir.join("sample.h5");
        let file = hdf5::File::create(&path).unwrap();
        let group = file.create_group("Unnamed").unwrap();
        group.new_dataset::<i32>().shape((18, 4)).create("Connections").unwrap();
        file.new_dataset::<f64>().shape(10_000).create("D1").unwrap();
        file.new_attr::<i32>().shape(3).create("tags").unwrap().write_raw(&[1, 2, 3]).unwrap();
        drop(file);

        let adapter = LocalFsAdapter::new(dir).unwrap();
        let pool = crate::pool::ReaderPool::new(Arc::new(adapter), 4);
        pool.acquire("sample.h5", &CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn children_are_sorted_lexicographically_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let handle = fixture_handle(dir.path()).await;

        let kids = children(&handle, "/").unwrap();
        let names: Vec<&str> = kids.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["D1", "Unnamed"]);
        let dataset = kids.iter().find(|c| c.name == "D1").unwrap();
        assert_eq!(dataset.kind, NodeKind::Dataset);
        assert_eq!(dataset.shape, Some(vec![10_000]));
        let group = kids.iter().find(|c| c.name == "Unnamed").unwrap();
        assert_eq!(group.kind, NodeKind::Group);
        assert!(group.shape.is_none());
    }

    #[tokio::test]
    async fn children_on_a_dataset_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let handle = fixture_handle(dir.path()).await;
        assert!(children(&handle, "/D1").is_err());
    }

    #[tokio::test]
    async fn meta_reports_shape_ndim_and_size_for_a_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let handle = fixture_handle(dir.path()).await;

        let node = meta(&handle, "/Unnamed/Connections").unwrap();
        match node {
            NodeMeta::Dataset { shape, ndim, size, element_type, .. } => {
                assert_eq!(shape, vec![18, 4]);
                assert_eq!(ndim, 2);
                assert_eq!(size, 72);
                assert!(element_type.is_numeric_plottable());
            }
            NodeMeta::Group { .. } => panic!("expected a dataset"),
        }
    }

    #[tokio::test]
    async fn meta_reports_child_count_and_attributes_for_a_group() {
        let dir = tempfile::tempdir().unwrap();
        let handle = fixture_handle(dir.path()).await;

        let node = meta(&handle, "/").unwrap();
        match node {
            NodeMeta::Group { child_count, attributes, .. } => {
                assert_eq!(child_count, 2);
                let tags = attributes.iter().find(|a| a.name == "tags").unwrap();
                assert!(tags.value.is_some());
            }
            NodeMeta::Dataset { .. } => panic!("expected a group"),
        }
    }
}
