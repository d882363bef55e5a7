//! HTTP transport for pull and push queries.

use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use ripple_core::{EndpointConfig, QueryConfig, RippleConfig, RowFormat};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::ClientError;
use crate::protocol::{BackendError, StreamFrame, parse_body, preview};
use crate::row::{QueryResult, Row};
use crate::stream::{PushCallbacks, StreamAudit, StreamingQueryHandle};

const NDJSON: &str = "application/vnd.ksqlapi.delimited.v1, application/json";

/// Body of the statement and close-query endpoints.
#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    properties: BTreeMap<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CloseQueryRequest<'a> {
    query_id: &'a str,
}

/// Executes statements against the engine's HTTP API.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct QueryClient {
    http: reqwest::Client,
    endpoint: EndpointConfig,
    config: QueryConfig,
    api_key: Option<String>,
}

impl QueryClient {
    pub fn new(endpoint: EndpointConfig, config: QueryConfig) -> Result<Self, ClientError> {
        // No overall timeout on the client: push queries stay open. Pull
        // requests set their own.
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        let api_key = endpoint.resolved_api_key();

        Ok(Self {
            http,
            endpoint,
            config,
            api_key,
        })
    }

    pub fn from_config(config: &RippleConfig) -> Result<Self, ClientError> {
        Self::new(config.endpoint.clone(), config.query.clone())
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    fn post(&self, url: &str, body: &impl Serialize) -> reqwest::RequestBuilder {
        let mut request = self.http.post(url).header(ACCEPT, NDJSON).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    fn statement_request<'a>(
        &self,
        statement: &'a str,
        properties: &BTreeMap<String, Value>,
    ) -> StatementRequest<'a> {
        let mut merged = self.config.properties.clone();
        merged.extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        StatementRequest {
            statement,
            properties: merged,
        }
    }

    /// Run a one-shot query and collect its result.
    pub async fn pull(&self, statement: &str) -> Result<QueryResult, ClientError> {
        self.pull_with(statement, &BTreeMap::new()).await
    }

    /// Run a one-shot query with extra statement properties.
    ///
    /// Connect errors and timeouts are retried up to `max_retries` times with
    /// a linear backoff.
    pub async fn pull_with(
        &self,
        statement: &str,
        properties: &BTreeMap<String, Value>,
    ) -> Result<QueryResult, ClientError> {
        let url = self.endpoint.query_url();
        let body = self.statement_request(statement, properties);
        let timeout = self.config.request_timeout();
        let max_retries = self.config.max_retries;
        let mut retries = 0;

        tracing::debug!(
            statement = %preview(statement),
            len = statement.len(),
            "Starting pull query"
        );
        let overall_start = Instant::now();

        loop {
            let attempt_start = Instant::now();
            tracing::debug!(
                url = %url,
                attempt = retries + 1,
                max_attempts = max_retries + 1,
                "Sending statement"
            );

            match self.post(&url, &body).timeout(timeout).send().await {
                Ok(response) => {
                    let result = self.read_pull(response, timeout).await;
                    match &result {
                        Ok(r) => tracing::info!(
                            rows = r.row_count(),
                            duration_ms = overall_start.elapsed().as_millis() as u64,
                            "Pull query finished"
                        ),
                        Err(e) => tracing::warn!(
                            error = %e,
                            duration_ms = overall_start.elapsed().as_millis() as u64,
                            "Pull query failed"
                        ),
                    }
                    return result;
                }
                Err(e) if retries < max_retries && is_retriable(&e) => {
                    tracing::warn!(
                        attempt = retries + 1,
                        max_attempts = max_retries + 1,
                        error = %e,
                        duration_ms = attempt_start.elapsed().as_millis() as u64,
                        "Retriable transport error"
                    );
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(100 * retries as u64)).await;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        duration_ms = attempt_start.elapsed().as_millis() as u64,
                        total_ms = overall_start.elapsed().as_millis() as u64,
                        "Pull query failed"
                    );
                    return Err(ClientError::from_transport(e, Some(timeout)));
                }
            }
        }
    }

    async fn read_pull(
        &self,
        response: reqwest::Response,
        timeout: Duration,
    ) -> Result<QueryResult, ClientError> {
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::from_transport(e, Some(timeout)))?;
        aggregate(&body, self.config.row_format)
    }

    /// Start a push query.
    ///
    /// Fails when the request cannot be sent or the engine rejects it
    /// outright. Once the stream is open, everything is reported through
    /// `callbacks`.
    pub async fn stream(
        &self,
        statement: &str,
        callbacks: PushCallbacks,
    ) -> Result<StreamingQueryHandle, ClientError> {
        self.start_stream(statement, &BTreeMap::new(), callbacks, None)
            .await
    }

    /// Start a push query with extra statement properties.
    pub async fn stream_with(
        &self,
        statement: &str,
        properties: &BTreeMap<String, Value>,
        callbacks: PushCallbacks,
    ) -> Result<StreamingQueryHandle, ClientError> {
        self.start_stream(statement, properties, callbacks, None)
            .await
    }

    pub(crate) async fn start_stream(
        &self,
        statement: &str,
        properties: &BTreeMap<String, Value>,
        callbacks: PushCallbacks,
        audit: Option<StreamAudit>,
    ) -> Result<StreamingQueryHandle, ClientError> {
        let url = self.endpoint.query_url();
        let body = self.statement_request(statement, properties);

        tracing::info!(statement = %preview(statement), "Starting push query");

        let response = self
            .post(&url, &body)
            .send()
            .await
            .map_err(|e| ClientError::from_transport(e, None))?;
        if !response.status().is_success() {
            let err = status_error(response).await;
            tracing::warn!(error = %err, "Push query rejected");
            return Err(err);
        }

        Ok(StreamingQueryHandle::spawn(
            self.clone(),
            statement,
            response,
            callbacks,
            audit,
        ))
    }

    /// Ask the engine to release a push query. "Not found" counts as success.
    pub async fn close_query(&self, query_id: &str) -> Result<(), ClientError> {
        let url = self.endpoint.close_query_url();
        let timeout = self.config.request_timeout();

        let response = self
            .post(&url, &CloseQueryRequest { query_id })
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ClientError::from_transport(e, Some(timeout)))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            tracing::debug!(query_id, status = status.as_u16(), "Query released");
            return Ok(());
        }

        let err = status_error(response).await;
        if is_not_found(&err) {
            tracing::debug!(query_id, "Query already gone");
            return Ok(());
        }
        tracing::warn!(query_id, error = %err, "Failed to release query");
        Err(err)
    }
}

fn is_retriable(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Error for a non-success response, preferring the engine's own error object.
async fn status_error(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match BackendError::from_body(&body) {
        Some(err) => err.into(),
        None => ClientError::Status {
            status: status.as_u16(),
            body,
        },
    }
}

fn is_not_found(err: &ClientError) -> bool {
    let text = match err {
        ClientError::Backend { message, .. } => message,
        ClientError::Status { body, .. } => body,
        _ => return false,
    }
    .to_ascii_lowercase();
    ["not found", "does not exist", "no query with id"]
        .iter()
        .any(|needle| text.contains(needle))
}

/// Collect a pull response body.
///
/// Malformed lines are skipped. An engine error anywhere in the body fails
/// the whole query, as does a body where no line could be read.
pub(crate) fn aggregate(body: &[u8], format: RowFormat) -> Result<QueryResult, ClientError> {
    let mut result = QueryResult::default();
    let mut readable = 0usize;
    let mut malformed = 0usize;

    for item in parse_body(body) {
        let frame = match item {
            Ok(frame) => frame,
            Err(e) => {
                malformed += 1;
                tracing::warn!(error = %e, "Skipping malformed response line");
                continue;
            }
        };
        readable += 1;
        match frame {
            StreamFrame::Header(header) => {
                if result.header.is_none() {
                    result.header = Some(header);
                }
            }
            StreamFrame::Row(values) => {
                let row = Row::new(values, result.header.as_ref(), format);
                result.rows.push(row);
            }
            StreamFrame::Error(err) => return Err(err.into()),
            StreamFrame::Message(message) => result.messages.push(message),
        }
    }

    if readable == 0 && malformed > 0 {
        return Err(ClientError::Parse(format!(
            "none of the {} response lines could be parsed",
            malformed
        )));
    }
    Ok(result)
}
