//! Axum application state: the engine singletons constructed once in
//! `main.rs` and shared read-only across every request handler.

use h5gate_core::cache::{ListingCache, MetaCache};
use h5gate_core::config::LimitsConfig;
use h5gate_core::lifecycle::Lifecycle;
use h5gate_core::pool::ReaderPool;
use std::sync::Arc;
use std::time::Instant;

/// Everything a handler needs, injected once at startup. Never holds a
/// lock across an `.await` — the pool and caches manage their own internal
/// synchronization.
#[derive(Clone)]
pub struct AppContext {
    pub readers: Arc<ReaderPool>,
    pub listing_cache: Arc<ListingCache>,
    pub meta_cache: Arc<MetaCache>,
    pub lifecycle: Arc<Lifecycle>,
    pub limits: Arc<LimitsConfig>,
    pub start_time: Instant,
}
