//! Shared application state handed to every route.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::cache::ResponseCache;
use crate::error::ApiError;
use crate::jobs::{BatchTask, JobRegistry};
use crate::model::{EntityRuntime, ModelGraph, RouteRegistry, RouterConfig};
use crate::store::DataStore;

#[derive(Clone)]
pub struct AppState {
    pub graph: Arc<ModelGraph>,
    pub store: Arc<dyn DataStore>,
    /// Entity runtimes keyed by url slug. Immutable after mount.
    pub runtimes: Arc<HashMap<String, Arc<EntityRuntime>>>,
    pub registry: Arc<RouteRegistry>,
    pub cache: Arc<ResponseCache>,
    pub jobs: Arc<JobRegistry>,
    pub batch_tx: UnboundedSender<BatchTask>,
    pub config: Arc<RouterConfig>,
}

impl AppState {
    pub fn runtime(&self, slug: &str) -> Result<Arc<EntityRuntime>, ApiError> {
        self.runtimes.get(slug).cloned().ok_or_else(ApiError::not_found)
    }

    /// First runtime serving the given model; `_ret` redirects render
    /// related rows with that entity's shape.
    pub fn runtime_for_model(&self, model: &str) -> Option<Arc<EntityRuntime>> {
        self.runtimes
            .values()
            .find(|rt| rt.model.name == model)
            .cloned()
    }
}
