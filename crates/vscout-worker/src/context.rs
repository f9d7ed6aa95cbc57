//! Shared handles for the pipeline components.

use std::sync::Arc;

use vscout_media::ChunkSplitter;
use vscout_ml_client::AnalysisClient;
use vscout_queue::MessagePublisher;

use crate::config::WorkerConfig;
use crate::store::JobStore;

/// Everything the orchestrator, chunk worker, finalizer and reconciler
/// touch outside their own logic. Cheap to clone.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<WorkerConfig>,
    pub store: Arc<dyn JobStore>,
    pub splitter: Arc<dyn ChunkSplitter>,
    pub analysis: Arc<dyn AnalysisClient>,
    pub publisher: Arc<dyn MessagePublisher>,
}

impl PipelineContext {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        splitter: Arc<dyn ChunkSplitter>,
        analysis: Arc<dyn AnalysisClient>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            splitter,
            analysis,
            publisher,
        }
    }
}
