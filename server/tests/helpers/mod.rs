//! Test harness for HTTP API integration tests.
//!
//! Builds a small HDF5 fixture under a temp dir, wires a real
//! `h5gate_server::build_router` on top of a `LocalFsAdapter` rooted there,
//! and drives requests through the router directly via `tower::ServiceExt`
//! — no subprocess, no bound TCP socket.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use h5gate_core::cache::TtlCache;
use h5gate_core::config::LimitsConfig;
use h5gate_core::lifecycle::Lifecycle;
use h5gate_core::pool::ReaderPool;
use h5gate_core::storage::LocalFsAdapter;
use h5gate_server::types::AppContext;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tower::ServiceExt;

pub struct TestHarness {
    router: axum::Router,
    _temp_dir: TempDir,
}

impl TestHarness {
    /// Build a harness over a freshly written `sample.h5` containing the
    /// fixture shapes the endpoint tests exercise:
    /// `/Unnamed` (group) -> `/Unnamed/Connections` (int32 `[18,4]`),
    /// `/D1` (float64 `[10000]`), `/Grid` (float64 `[50,80]`).
    pub fn new() -> Self {
        Self::with_limits(LimitsConfig {
            max_extract_elements: 25_000_000,
            exact_line_points: 20_000,
            heatmap_max_side: 1024,
            concurrent_requests: 32,
        })
    }

    /// Same fixture, but with caller-supplied limits — for tests that need
    /// a tight ceiling (e.g. `exact_line_points`) to exercise in a fixture
    /// small enough to keep the harness fast.
    pub fn with_limits(limits: LimitsConfig) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        write_fixture(&temp_dir.path().join("sample.h5"));

        let adapter = LocalFsAdapter::new(temp_dir.path()).expect("local adapter");
        let readers = Arc::new(ReaderPool::new(Arc::new(adapter), 16));
        let listing_cache = Arc::new(TtlCache::new(Duration::from_secs(30)));
        let meta_cache = Arc::new(TtlCache::new(Duration::from_secs(300)));
        let lifecycle = Arc::new(Lifecycle::new(32));
        let limits = Arc::new(limits);

        let ctx = AppContext {
            readers,
            listing_cache,
            meta_cache,
            lifecycle,
            limits,
            start_time: Instant::now(),
        };

        Self { router: h5gate_server::build_router(ctx), _temp_dir: temp_dir }
    }

    /// Path to the fixture file on disk, for tests that mutate it directly
    /// (e.g. to exercise freshness invalidation).
    pub fn fixture_path(&self) -> std::path::PathBuf {
        self._temp_dir.path().join("sample.h5")
    }

    /// Issue a GET request against the wired router and return the status
    /// plus the parsed JSON body.
    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    /// Issue a GET request and return the status plus the raw response body
    /// as text, for endpoints (CSV export) that don't return JSON.
    pub async fn get_text(&self, uri: &str) -> (StatusCode, String) {
        let response = self
            .router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }
}

fn write_fixture(path: &std::path::Path) {
    let file = hdf5::File::create(path).expect("create fixture");

    let group = file.create_group("Unnamed").expect("create group");
    let connections: Vec<i32> = (0..72).collect();
    group
        .new_dataset::<i32>()
        .shape((18, 4))
        .create("Connections")
        .expect("create dataset")
        .write_raw(&connections)
        .expect("write dataset");

    let line: Vec<f64> = (0..10_000).map(|i| i as f64).collect();
    file.new_dataset::<f64>()
        .shape(10_000)
        .create("D1")
        .expect("create D1")
        .write_raw(&line)
        .expect("write D1");

    let grid: Vec<f64> = (0..(50 * 80)).map(|i| i as f64).collect();
    file.new_dataset::<f64>()
        .shape((50, 80))
        .create("Grid")
        .expect("create Grid")
        .write_raw(&grid)
        .expect("write Grid");
}
