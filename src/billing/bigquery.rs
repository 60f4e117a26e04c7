//! BigQuery REST reader for the Cloud Billing export table.
//!
//! Uses `jobs.query` to start the query and `jobs.getQueryResults` to wait
//! for completion and page through rows. Each page is decoded and yielded
//! record by record; the next page is only requested once the previous one
//! has been consumed.

use std::{collections::BTreeMap, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    BillingRecord, BillingSource, DateRange, QueryError,
    query::{self, COLUMNS, TableRef},
};
use crate::{
    config::SyncConfig,
    gcp::{self, AccessTokenSource},
    observability::metrics,
};

/// Reads billing records through the BigQuery REST API.
pub struct BigQueryReader {
    client: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
    base_url: String,
    job_project: String,
    table: TableRef,
    location: Option<String>,
    page_size: u32,
    job_timeout_ms: u64,
    poll_interval: Duration,
    max_poll_attempts: u32,
}

impl BigQueryReader {
    pub fn from_config(
        config: &SyncConfig,
        client: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Result<Self, QueryError> {
        let bq = &config.bigquery;
        let table = TableRef::new(&config.gcp.project_id, &bq.dataset_id, &bq.table_id)?;
        let job_project = config.job_project().to_string();
        query::validate_project_id(&job_project)?;

        Ok(Self {
            client,
            tokens,
            base_url: bq.base_url.trim_end_matches('/').to_string(),
            job_project,
            table,
            location: bq.location.clone(),
            page_size: bq.page_size,
            job_timeout_ms: bq.job_timeout_ms,
            poll_interval: Duration::from_millis(bq.poll_interval_ms),
            max_poll_attempts: bq.max_poll_attempts,
        })
    }

    fn queries_url(&self) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/queries",
            self.base_url, self.job_project
        )
    }

    async fn bearer(&self) -> Result<String, QueryError> {
        Ok(format!("Bearer {}", self.tokens.access_token().await?))
    }

    /// Issue `jobs.query` and wait until the first page is available.
    async fn start_query(&self, range: &DateRange) -> Result<QueryResponse, QueryError> {
        let mut body = json!({
            "query": query::records_sql(&self.table)?,
            "useLegacySql": false,
            "parameterMode": "NAMED",
            "queryParameters": query::range_parameters(range),
            "maxResults": self.page_size,
            "timeoutMs": self.job_timeout_ms,
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }

        tracing::debug!(%range, table = %self.table.quoted(), "Starting billing query");

        let response = self
            .client
            .post(self.queries_url())
            .header("Authorization", self.bearer().await?)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let first: QueryResponse = decode_json(response).await?;

        if first.job_complete {
            return Ok(first);
        }

        let job = first.job_reference.ok_or_else(|| {
            QueryError::Decode("incomplete job response without jobReference".into())
        })?;
        self.fetch_results(&job, None).await
    }

    /// Poll `getQueryResults` until the job is complete and return the page.
    async fn fetch_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, QueryError> {
        let url = format!("{}/{}", self.queries_url(), job.job_id);
        let location = job.location.as_ref().or(self.location.as_ref());

        for attempt in 0..self.max_poll_attempts {
            let mut request = self
                .client
                .get(&url)
                .header("Authorization", self.bearer().await?)
                .query(&[
                    ("maxResults", self.page_size.to_string()),
                    ("timeoutMs", self.job_timeout_ms.to_string()),
                ]);
            if let Some(token) = page_token {
                request = request.query(&[("pageToken", token)]);
            }
            if let Some(location) = location {
                request = request.query(&[("location", location)]);
            }

            let response = request.send().await.map_err(transport_error)?;
            let page: QueryResponse = decode_json(response).await?;
            if page.job_complete {
                return Ok(page);
            }

            tracing::debug!(job_id = %job.job_id, attempt = attempt + 1, "Billing query still running");
            tokio::time::sleep(self.poll_interval).await;
        }

        Err(QueryError::Unavailable(format!(
            "job {} did not complete after {} polls",
            job.job_id, self.max_poll_attempts
        )))
    }

    /// Fetch one page for the cursor and work out where the next one comes from.
    async fn next_page(
        &self,
        range: &DateRange,
        cursor: Cursor,
    ) -> Result<Option<(Vec<BillingRecord>, Cursor)>, QueryError> {
        let page = match cursor {
            Cursor::Done => return Ok(None),
            Cursor::Start => self.start_query(range).await?,
            Cursor::Page { job, page_token } => self.fetch_results(&job, Some(&page_token)).await?,
        };

        let records = page
            .rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()?;
        metrics::record_billing_records_read(records.len() as u64);

        let next = match (page.page_token, page.job_reference) {
            (Some(page_token), Some(job)) => Cursor::Page { job, page_token },
            (Some(_), None) => {
                return Err(QueryError::Decode(
                    "pageToken present without jobReference".into(),
                ));
            }
            (None, _) => Cursor::Done,
        };

        tracing::debug!(%range, rows = records.len(), more = !matches!(next, Cursor::Done), "Fetched billing page");
        Ok(Some((records, next)))
    }
}

#[async_trait]
impl BillingSource for BigQueryReader {
    fn records(&self, range: DateRange) -> BoxStream<'_, Result<BillingRecord, QueryError>> {
        futures::stream::try_unfold(Cursor::Start, move |cursor| async move {
            self.next_page(&range, cursor).await
        })
        .map_ok(|page| futures::stream::iter(page.into_iter().map(Ok::<_, QueryError>)))
        .try_flatten()
        .boxed()
    }

    async fn health_check(&self) -> Result<(), QueryError> {
        let body = json!({
            "query": query::probe_sql(&self.table)?,
            "useLegacySql": false,
            "dryRun": true,
        });
        let response = self
            .client
            .post(self.queries_url())
            .header("Authorization", self.bearer().await?)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let _: Value = decode_json(response).await?;
        Ok(())
    }
}

enum Cursor {
    Start,
    Page {
        job: JobReference,
        page_token: String,
    },
    Done,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: Value,
}

#[derive(Debug, Deserialize)]
struct LabelEntry {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

fn transport_error(e: reqwest::Error) -> QueryError {
    QueryError::Unavailable(e.to_string())
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, QueryError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = gcp::error_message(&body);
        return Err(
            if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                QueryError::Unavailable(format!("{}: {}", status, message))
            } else {
                QueryError::Rejected {
                    status: status.as_u16(),
                    message,
                }
            },
        );
    }

    response
        .json::<T>()
        .await
        .map_err(|e| QueryError::Decode(e.to_string()))
}

fn decode_row(row: &TableRow) -> Result<BillingRecord, QueryError> {
    if row.f.len() != COLUMNS.len() {
        return Err(QueryError::Decode(format!(
            "expected {} columns, got {}",
            COLUMNS.len(),
            row.f.len()
        )));
    }

    let text = |index: usize| -> Result<Option<&str>, QueryError> {
        match &row.f[index].v {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.as_str())),
            other => Err(QueryError::Decode(format!(
                "column {} is not a string: {}",
                COLUMNS[index], other
            ))),
        }
    };
    let required = |index: usize| -> Result<&str, QueryError> {
        text(index)?
            .ok_or_else(|| QueryError::Decode(format!("column {} is null", COLUMNS[index])))
    };

    Ok(BillingRecord {
        service: required(0)?.to_string(),
        sku: required(1)?.to_string(),
        usage_start: parse_timestamp(COLUMNS[2], required(2)?)?,
        usage_end: parse_timestamp(COLUMNS[3], required(3)?)?,
        cost: parse_cost(required(4)?)?,
        currency: required(5)?.to_string(),
        project_id: text(6)?.filter(|p| !p.is_empty()).map(str::to_string),
        labels: parse_labels(text(7)?)?,
    })
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, QueryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| QueryError::Decode(format!("{} '{}': {}", column, value, e)))
}

fn parse_cost(value: &str) -> Result<Decimal, QueryError> {
    Decimal::from_str(value)
        .or_else(|_| Decimal::from_scientific(value))
        .map_err(|e| QueryError::Decode(format!("cost '{}': {}", value, e)))
}

fn parse_labels(value: Option<&str>) -> Result<BTreeMap<String, String>, QueryError> {
    let Some(json) = value else {
        return Ok(BTreeMap::new());
    };
    let entries: Vec<LabelEntry> =
        serde_json::from_str(json).map_err(|e| QueryError::Decode(format!("labels: {}", e)))?;
    Ok(entries
        .into_iter()
        .map(|entry| (entry.key, entry.value.unwrap_or_default()))
        .collect())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal::dec;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path, query_param},
    };

    use super::*;
    use crate::gcp::StaticTokenSource;

    const QUERIES_PATH: &str = "/bigquery/v2/projects/acme-billing/queries";

    fn test_config(base_url: &str) -> SyncConfig {
        SyncConfig::from_str(&format!(
            r#"
            [gcp]
            project_id = "acme-billing"

            [bigquery]
            dataset_id = "billing"
            table_id = "export"
            base_url = "{}"
            page_size = 2
            poll_interval_ms = 1
            max_poll_attempts = 3
        "#,
            base_url
        ))
        .unwrap()
    }

    fn reader(server: &MockServer) -> BigQueryReader {
        BigQueryReader::from_config(
            &test_config(&server.uri()),
            reqwest::Client::new(),
            Arc::new(StaticTokenSource("test-token".into())),
        )
        .unwrap()
    }

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        )
        .unwrap()
    }

    fn row(service: &str, cost: &str, project: Option<&str>) -> Value {
        json!({"f": [
            {"v": service},
            {"v": "Storage"},
            {"v": "2024-01-05T10:00:00Z"},
            {"v": "2024-01-05T11:00:00Z"},
            {"v": cost},
            {"v": "USD"},
            {"v": project},
            {"v": "[{\"key\":\"team\",\"value\":\"data\"}]"},
        ]})
    }

    #[test]
    fn test_decode_row() {
        let row: TableRow = serde_json::from_value(row("BigQuery", "1.250000000", None)).unwrap();
        let record = decode_row(&row).unwrap();
        assert_eq!(record.service, "BigQuery");
        assert_eq!(record.cost, dec!(1.25));
        assert_eq!(record.project_id, None);
        assert_eq!(record.labels.get("team").map(String::as_str), Some("data"));
        assert!(record.usage_end > record.usage_start);
    }

    #[test]
    fn test_decode_row_bad_cost() {
        let row: TableRow = serde_json::from_value(row("BigQuery", "lots", None)).unwrap();
        assert!(matches!(decode_row(&row), Err(QueryError::Decode(_))));
    }

    #[test]
    fn test_decode_row_wrong_width() {
        let row: TableRow = serde_json::from_value(json!({"f": [{"v": "x"}]})).unwrap();
        assert!(matches!(decode_row(&row), Err(QueryError::Decode(_))));
    }

    #[tokio::test]
    async fn test_pages_through_results() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .and(header("Authorization", "Bearer test-token"))
            .and(body_partial_json(json!({
                "useLegacySql": false,
                "parameterMode": "NAMED",
                "maxResults": 2,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"projectId": "acme-billing", "jobId": "job_1", "location": "US"},
                "jobComplete": true,
                "totalRows": "3",
                "rows": [row("BigQuery", "1.5", Some("proj-a")), row("Compute Engine", "2", Some("proj-b"))],
                "pageToken": "page-2",
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(format!("{}/job_1", QUERIES_PATH)))
            .and(query_param("pageToken", "page-2"))
            .and(query_param("location", "US"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"projectId": "acme-billing", "jobId": "job_1", "location": "US"},
                "jobComplete": true,
                "rows": [row("Cloud Storage", "0.25", None)],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reader = reader(&server);
        let records: Vec<BillingRecord> = reader.records(range()).try_collect().await.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].service, "BigQuery");
        assert_eq!(records[2].service, "Cloud Storage");
        assert_eq!(records[2].project_id, None);
    }

    #[tokio::test]
    async fn test_polls_until_job_complete() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"jobId": "job_slow"},
                "jobComplete": false,
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(format!("{}/job_slow", QUERIES_PATH)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"jobId": "job_slow"},
                "jobComplete": true,
                "rows": [row("BigQuery", "3", None)],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let records: Vec<BillingRecord> =
            reader(&server).records(range()).try_collect().await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_limit_exceeded() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"jobId": "job_stuck"},
                "jobComplete": false,
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(format!("{}/job_stuck", QUERIES_PATH)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"jobId": "job_stuck"},
                "jobComplete": false,
            })))
            .expect(3)
            .mount(&server)
            .await;

        let result: Result<Vec<BillingRecord>, _> =
            reader(&server).records(range()).try_collect().await;
        assert!(matches!(result, Err(QueryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_empty_result() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"jobId": "job_empty"},
                "jobComplete": true,
                "totalRows": "0",
            })))
            .mount(&server)
            .await;

        let records: Vec<BillingRecord> =
            reader(&server).records(range()).try_collect().await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_query_maps_to_rejected() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": 404, "message": "Not found: Table acme-billing:billing.export", "status": "NOT_FOUND"}
            })))
            .mount(&server)
            .await;

        let result: Result<Vec<BillingRecord>, _> =
            reader(&server).records(range()).try_collect().await;
        match result {
            Err(QueryError::Rejected { status, message }) => {
                assert_eq!(status, 404);
                assert!(message.contains("Not found"));
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_maps_to_unavailable() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .respond_with(ResponseTemplate::new(503).set_body_string("backend error"))
            .mount(&server)
            .await;

        let result: Result<Vec<BillingRecord>, _> =
            reader(&server).records(range()).try_collect().await;
        assert!(matches!(result, Err(QueryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let reader = reader(&server);
        let stream = reader.records(range());
        drop(stream);
    }

    #[tokio::test]
    async fn test_health_check_dry_run() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .and(body_partial_json(json!({"dryRun": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"jobId": "dry"},
                "jobComplete": true,
            })))
            .expect(1)
            .mount(&server)
            .await;

        reader(&server).health_check().await.unwrap();
    }
}
