//! Shared test fixtures and end-to-end tests across the Google API stubs.

mod shutdown;

use std::sync::Arc;

use crate::{
    AppState,
    billing::memory::InMemoryBillingSource,
    config::SyncConfig,
    runs::RunRegistry,
    sheets::memory::InMemorySheetWriter,
    sync::SyncPipeline,
};

/// Minimal valid configuration with fast retries.
pub fn test_config() -> SyncConfig {
    SyncConfig::from_str(
        r#"
        [gcp]
        project_id = "acme-billing"

        [bigquery]
        dataset_id = "billing"
        table_id = "export"

        [sheets.retry]
        initial_delay_ms = 1
        max_delay_ms = 5
        jitter = 0.0
    "#,
    )
    .unwrap()
}

pub fn test_pipeline(
    source: InMemoryBillingSource,
    writer: Arc<InMemorySheetWriter>,
) -> SyncPipeline {
    SyncPipeline::new(
        Arc::new(test_config()),
        Arc::new(source),
        writer,
        RunRegistry::new(),
    )
}

pub fn test_state(source: InMemoryBillingSource, writer: Arc<InMemorySheetWriter>) -> AppState {
    AppState::with_components(Arc::new(test_config()), Arc::new(source), writer)
}
