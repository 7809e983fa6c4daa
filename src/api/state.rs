use std::sync::Arc;

use tokio::sync::mpsc;

use crate::features::Observation;
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// Queue into the running pipeline. `None` serves history only.
    pub ingest: Option<mpsc::Sender<Observation>>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, ingest: Option<mpsc::Sender<Observation>>) -> Self {
        Self { pipeline, ingest }
    }
}
