//! In-memory billing source for tests.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::{BillingRecord, BillingSource, DateRange, QueryError};

#[derive(Default)]
pub struct InMemoryBillingSource {
    records: Vec<BillingRecord>,
    delay: Option<Duration>,
    failure: Mutex<Option<QueryError>>,
    health_failure: Mutex<Option<QueryError>>,
    queries: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryBillingSource {
    pub fn new(records: Vec<BillingRecord>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    /// Sleep before yielding the first record of every query.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next query with `error`.
    pub fn fail_next(&self, error: QueryError) {
        *self.failure.lock() = Some(error);
    }

    /// Fail the next health check with `error`.
    pub fn fail_health(&self, error: QueryError) {
        *self.health_failure.lock() = Some(error);
    }

    /// Number of range queries issued so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Most queries ever outstanding at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BillingSource for InMemoryBillingSource {
    fn records(&self, range: DateRange) -> BoxStream<'_, Result<BillingRecord, QueryError>> {
        let delay = self.delay;
        futures::stream::once(async move {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let failure = self.failure.lock().take();
            if let Some(error) = failure {
                return futures::stream::iter(vec![Err(error)]);
            }
            let matching: Vec<_> = self
                .records
                .iter()
                .filter(|r| range.contains(r.usage_start))
                .cloned()
                .map(Ok)
                .collect();
            futures::stream::iter(matching)
        })
        .flatten()
        .boxed()
    }

    async fn health_check(&self) -> Result<(), QueryError> {
        match self.health_failure.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Builder for test records.
pub fn record(service: &str, project: Option<&str>, usage_start: &str, cost: Decimal) -> BillingRecord {
    let usage_start: DateTime<Utc> = usage_start.parse().unwrap();
    BillingRecord {
        service: service.to_string(),
        sku: format!("{} usage", service),
        usage_start,
        usage_end: usage_start + chrono::Duration::hours(1),
        cost,
        currency: "USD".to_string(),
        project_id: project.map(str::to_string),
        labels: Default::default(),
    }
}
