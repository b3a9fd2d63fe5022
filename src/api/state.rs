//! Shared state handed to every REST handler, the same `with_state`
//! extractor shape the websocket publish transport already uses for its own
//! `ConnectionManager`. Axum's `FromRef` lets a handler pull just the
//! sub-state it needs (e.g. the websocket upgrade only wants the
//! `ConnectionManager`, not the whole bundle).

use std::sync::Arc;

use axum::extract::FromRef;

use crate::backpressure::BackpressureController;
use crate::blotter_store::BlotterStore;
use crate::config::UploadConfig;
use crate::dispatcher::PartitionDispatcher;
use crate::job_registry::JobRegistry;
use crate::publisher::websocket::ConnectionManager;
use crate::sequence_buffer::SequenceBuffer;

pub struct AppState {
    pub dispatcher: Arc<PartitionDispatcher>,
    pub blotters: Arc<dyn BlotterStore>,
    pub jobs: Arc<dyn JobRegistry>,
    pub backpressure: Arc<BackpressureController>,
    pub sequence_buffer: Arc<SequenceBuffer>,
    pub ws_manager: Arc<ConnectionManager>,
    pub upload: UploadConfig,
    pub service_name: String,
}

impl FromRef<Arc<AppState>> for Arc<ConnectionManager> {
    fn from_ref(state: &Arc<AppState>) -> Self {
        state.ws_manager.clone()
    }
}
