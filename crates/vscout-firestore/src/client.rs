//! Firestore REST API client.
//!
//! Production-grade client with:
//! - Token caching with refresh margin and a one-shot refresh on expiry
//! - HTTP client tuning (pooling, timeouts)
//! - Exponential backoff with jitter
//! - Observability (tracing spans, metrics)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, info_span, Instrument};

use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::{names as metric_names, record_request};
use crate::retry::{with_retry, RetryConfig};
use crate::token_cache::TokenCache;
use crate::types::{
    BatchWriteRequest, BatchWriteResponse, Document, ListDocumentsResponse, Precondition, RunQueryRequest,
    RunQueryResponse, StructuredQuery, Value, Write,
};

/// Firestore caps batch writes at 500 operations.
pub const MAX_BATCH_WRITES: usize = 500;

// =============================================================================
// Configuration
// =============================================================================

/// Firestore client configuration.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    /// GCP project ID
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    /// Request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Retry configuration
    pub retry: RetryConfig,
}

impl FirestoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        let project_id = std::env::var("GCP_PROJECT_ID")
            .or_else(|_| std::env::var("FIREBASE_PROJECT_ID"))
            .map_err(|_| {
                FirestoreError::auth_error(
                    "GCP_PROJECT_ID or FIREBASE_PROJECT_ID must be set to access Firestore",
                )
            })?;

        if project_id.is_empty() {
            return Err(FirestoreError::auth_error(
                "GCP_PROJECT_ID or FIREBASE_PROJECT_ID cannot be empty",
            ));
        }

        let connect_timeout_secs: u64 = std::env::var("FIRESTORE_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let timeout_secs: u64 = std::env::var("FIRESTORE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            project_id,
            database_id: std::env::var("FIRESTORE_DATABASE_ID")
                .unwrap_or_else(|_| "(default)".to_string()),
            timeout: Duration::from_secs(timeout_secs),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            retry: RetryConfig::from_env(),
        })
    }
}

// =============================================================================
// Client
// =============================================================================

/// Firestore REST API client.
#[derive(Clone)]
pub struct FirestoreClient {
    http: Client,
    config: FirestoreConfig,
    base_url: String,
    token_cache: Arc<TokenCache>,
}

impl FirestoreClient {
    /// Create a new Firestore client.
    pub async fn new(config: FirestoreConfig) -> FirestoreResult<Self> {
        let auth = Self::create_auth_provider()?;

        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("vscout-firestore/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FirestoreError::Network)?;

        let base_url = format!(
            "https://firestore.googleapis.com/v1/projects/{}/databases/{}/documents",
            config.project_id, config.database_id
        );

        Ok(Self {
            http,
            config,
            base_url,
            token_cache: Arc::new(TokenCache::new(auth)),
        })
    }

    fn create_auth_provider() -> FirestoreResult<Arc<dyn TokenProvider>> {
        let service_account = CustomServiceAccount::from_env()
            .map_err(|e| FirestoreError::auth_error(format!("Failed to load service account: {}", e)))?;

        match service_account {
            Some(sa) => Ok(Arc::new(sa)),
            None => Err(FirestoreError::auth_error(
                "GOOGLE_APPLICATION_CREDENTIALS not set. \
                 Set it to the path of your service account JSON file.",
            )),
        }
    }

    /// Create from environment variables.
    pub async fn from_env() -> FirestoreResult<Self> {
        let config = FirestoreConfig::from_env()?;
        Self::new(config).await
    }

    fn is_access_token_expired(body: &str) -> bool {
        body.contains("ACCESS_TOKEN_EXPIRED") || body.contains("\"UNAUTHENTICATED\"")
    }

    /// Build document path.
    fn document_url(&self, collection: &str, doc_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, doc_id)
    }

    /// Build full document name for batch operations.
    pub fn full_document_name(&self, collection: &str, doc_id: &str) -> String {
        format!(
            "projects/{}/databases/{}/documents/{}/{}",
            self.config.project_id, self.config.database_id, collection, doc_id
        )
    }

    /// Send an authorized request. An expired token is invalidated and the
    /// request re-sent once with a fresh one.
    async fn send<F>(&self, build: F) -> FirestoreResult<Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.token_cache.get_token().await?;
        let response = build(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if !Self::is_access_token_expired(&body) {
            return Err(FirestoreError::from_http_status(401, body));
        }

        debug!("Firestore access token expired, refreshing");
        self.token_cache.invalidate().await;
        let token = self.token_cache.get_token().await?;
        Ok(build(&token).send().await?)
    }

    // =========================================================================
    // CRUD Operations
    // =========================================================================

    /// Get a document.
    pub async fn get_document(&self, collection: &str, doc_id: &str) -> FirestoreResult<Option<Document>> {
        let url = self.document_url(collection, doc_id);

        self.execute_request("get_document", collection, Some(doc_id), || async {
            let response = self.send(|token| self.http.get(&url).bearer_auth(token)).await?;
            match response.status() {
                StatusCode::OK => Ok(Some(response.json().await?)),
                StatusCode::NOT_FOUND => Ok(None),
                status => Err(Self::error_from_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Create a document under a caller-chosen id.
    ///
    /// Fails with [`FirestoreError::AlreadyExists`] when the id is taken,
    /// which is what makes deterministic ids act as uniqueness constraints.
    pub async fn create_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
    ) -> FirestoreResult<Document> {
        let url = format!(
            "{}/{}?documentId={}",
            self.base_url,
            collection,
            urlencoding::encode(doc_id)
        );
        let body = Document::new(fields);

        self.execute_request("create_document", collection, Some(doc_id), || async {
            let response = self
                .send(|token| self.http.post(&url).bearer_auth(token).json(&body))
                .await?;
            match response.status() {
                StatusCode::OK | StatusCode::CREATED => Ok(response.json().await?),
                StatusCode::CONFLICT => Err(FirestoreError::AlreadyExists(format!("{}/{}", collection, doc_id))),
                status => Err(Self::error_from_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Patch a document, optionally restricted to `update_mask` and guarded
    /// by a precondition (document exists, or unchanged since a read).
    pub async fn update_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
        update_mask: Option<&[&str]>,
        precondition: Option<&Precondition>,
    ) -> FirestoreResult<Document> {
        let mut params: Vec<String> = Vec::new();
        if let Some(mask) = update_mask {
            params.extend(mask.iter().map(|f| format!("updateMask.fieldPaths={}", f)));
        }
        if let Some(pre) = precondition {
            if let Some(exists) = pre.exists {
                params.push(format!("currentDocument.exists={}", exists));
            }
            if let Some(ts) = &pre.update_time {
                params.push(format!("currentDocument.updateTime={}", urlencoding::encode(ts)));
            }
        }
        let mut url = self.document_url(collection, doc_id);
        if !params.is_empty() {
            url = format!("{}?{}", url, params.join("&"));
        }
        let body = Document::new(fields);
        let operation = if precondition.is_some() {
            "update_document_precondition"
        } else {
            "update_document"
        };

        self.execute_request(operation, collection, Some(doc_id), || async {
            let response = self
                .send(|token| self.http.patch(&url).bearer_auth(token).json(&body))
                .await?;
            match response.status() {
                StatusCode::OK => Ok(response.json().await?),
                StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => {
                    let body_text = response.text().await.unwrap_or_default();
                    Err(FirestoreError::PreconditionFailed(body_text))
                }
                StatusCode::NOT_FOUND => Err(FirestoreError::not_found(format!("{}/{}", collection, doc_id))),
                status => Err(Self::error_from_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Delete a document. Deleting a missing document succeeds.
    pub async fn delete_document(&self, collection: &str, doc_id: &str) -> FirestoreResult<()> {
        let url = self.document_url(collection, doc_id);

        self.execute_request("delete_document", collection, Some(doc_id), || async {
            let response = self.send(|token| self.http.delete(&url).bearer_auth(token)).await?;
            match response.status() {
                StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
                StatusCode::NOT_FOUND => {
                    debug!("Document {}/{} already deleted", collection, doc_id);
                    Ok(())
                }
                status => Err(Self::error_from_response(status, &url, response).await),
            }
        })
        .await
    }

    /// List one page of documents in a collection.
    pub async fn list_documents(
        &self,
        collection: &str,
        page_size: Option<u32>,
        page_token: Option<&str>,
    ) -> FirestoreResult<ListDocumentsResponse> {
        let mut url = format!("{}/{}", self.base_url, collection);
        let mut params = Vec::new();
        if let Some(size) = page_size {
            params.push(format!("pageSize={}", size));
        }
        if let Some(token) = page_token {
            params.push(format!("pageToken={}", urlencoding::encode(token)));
        }
        if !params.is_empty() {
            url = format!("{}?{}", url, params.join("&"));
        }

        self.execute_request("list_documents", collection, None, || async {
            let response = self.send(|token| self.http.get(&url).bearer_auth(token)).await?;
            match response.status() {
                StatusCode::OK => {
                    let list: ListDocumentsResponse = response.json().await?;
                    let returned = list.documents.as_ref().map(|d| d.len()).unwrap_or(0) as u64;
                    metrics::counter!(
                        metric_names::LIST_DOCUMENTS_RETURNED_TOTAL,
                        "collection" => collection.to_string()
                    )
                    .increment(returned);
                    Ok(list)
                }
                status => Err(Self::error_from_response(status, &url, response).await),
            }
        })
        .await
    }

    /// List every document in a collection, following page tokens.
    pub async fn list_all_documents(&self, collection: &str) -> FirestoreResult<Vec<Document>> {
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .list_documents(collection, Some(300), page_token.as_deref())
                .await?;
            documents.extend(page.documents.unwrap_or_default());
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(documents),
            }
        }
    }

    // =========================================================================
    // Batch Operations
    // =========================================================================

    /// Execute a non-atomic batch write. Each write succeeds or fails on its
    /// own; callers inspect [`BatchWriteResponse::outcomes`].
    pub async fn batch_write(&self, writes: Vec<Write>) -> FirestoreResult<BatchWriteResponse> {
        if writes.is_empty() {
            return Ok(BatchWriteResponse::empty());
        }
        if writes.len() > MAX_BATCH_WRITES {
            return Err(FirestoreError::request_failed(format!(
                "Batch write exceeds {} document limit",
                MAX_BATCH_WRITES
            )));
        }

        let url = format!("{}:batchWrite", self.base_url);
        let request = BatchWriteRequest { writes };

        self.execute_request("batch_write", "batch", None, || async {
            let response = self
                .send(|token| self.http.post(&url).bearer_auth(token).json(&request))
                .await?;
            match response.status() {
                StatusCode::OK => Ok(response.json().await?),
                status => Err(Self::error_from_response(status, &url, response).await),
            }
        })
        .await
    }

    // =========================================================================
    // Query Operations
    // =========================================================================

    /// Run a structured query.
    ///
    /// `parent_path` is the path containing the queried collection, e.g.
    /// `"analysis_jobs/JOB_ID"` for a job's events, or `""` for top-level
    /// collections.
    pub async fn run_query(&self, parent_path: &str, query: StructuredQuery) -> FirestoreResult<Vec<Document>> {
        let url = if parent_path.is_empty() {
            format!("{}:runQuery", self.base_url)
        } else {
            format!("{}/{}:runQuery", self.base_url, parent_path)
        };
        let request = RunQueryRequest {
            structured_query: query,
        };
        let label = request
            .structured_query
            .from
            .first()
            .map(|c| c.collection_id.clone())
            .unwrap_or_default();

        self.execute_request("run_query", &label, None, || async {
            let response = self
                .send(|token| self.http.post(&url).bearer_auth(token).json(&request))
                .await?;
            match response.status() {
                StatusCode::OK => {
                    let body = response.text().await.unwrap_or_default();
                    // runQuery returns a JSON array of RunQueryResponse objects
                    let responses: Vec<RunQueryResponse> = serde_json::from_str(&body).map_err(|e| {
                        FirestoreError::invalid_response(format!(
                            "Failed to parse runQuery response: {} (body prefix: {})",
                            e,
                            &body[..body.len().min(200)]
                        ))
                    })?;
                    Ok(responses.into_iter().filter_map(|r| r.document).collect())
                }
                status => Err(Self::error_from_response(status, &url, response).await),
            }
        })
        .await
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    /// Execute a request with retry, tracing and metrics.
    async fn execute_request<T, F, Fut>(
        &self,
        operation: &str,
        collection: &str,
        doc_id: Option<&str>,
        op: F,
    ) -> FirestoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = FirestoreResult<T>>,
    {
        let span = info_span!(
            "firestore_request",
            operation = %operation,
            collection = %collection,
            doc_id = doc_id.unwrap_or("")
        );

        let start = Instant::now();
        let result = with_retry(&self.config.retry, operation, op).instrument(span).await;
        let latency_ms = start.elapsed().as_millis() as f64;

        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status().unwrap_or(500),
        };
        record_request(operation, status, latency_ms);

        result
    }

    async fn error_from_response(status: StatusCode, url: &str, response: Response) -> FirestoreError {
        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let body = response.text().await.unwrap_or_default();

        match (status, retry_after_ms) {
            (StatusCode::TOO_MANY_REQUESTS, Some(ms)) => FirestoreError::RateLimited(ms),
            _ => FirestoreError::from_http_status(status.as_u16(), format!("{} failed: {}", url, body)),
        }
    }
}
