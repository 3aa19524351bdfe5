use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::PollConfig;
use crate::engine::Extractor;
use crate::error::ExtractionError;
use crate::remote::{JobService, JobSpec, RemoteJobClient};
use crate::types::WorkInput;

/// Runs one remote job per work item, with the item payload as job input.
///
/// Each extraction holds its worker slot for the whole poll loop, so the
/// engine's concurrency also caps how many remote jobs run at once.
pub struct RemoteJobExtractor<S: JobService + ?Sized> {
    client: RemoteJobClient<S>,
    program: String,
}

impl<S: JobService + ?Sized> RemoteJobExtractor<S> {
    pub fn new(client: RemoteJobClient<S>, program: impl Into<String>) -> Self {
        Self {
            client,
            program: program.into(),
        }
    }

    pub fn from_service(service: Arc<S>, config: PollConfig, program: impl Into<String>) -> Self {
        Self::new(RemoteJobClient::new(service, config), program)
    }
}

#[async_trait]
impl<S: JobService + ?Sized> Extractor for RemoteJobExtractor<S> {
    async fn extract(&self, input: &WorkInput) -> Result<Value, ExtractionError> {
        let spec = JobSpec::new(&self.program, input.payload.clone());
        let rows = self.client.run_default(&spec).await?;

        Ok(json!({
            "count": rows.len(),
            "rows": rows,
        }))
    }
}
