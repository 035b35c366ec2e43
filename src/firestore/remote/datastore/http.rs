use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::query::Query;
use crate::firestore::error::{internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, Mutation, MutationResult};
use crate::firestore::remote::connection::{Connection, ConnectionBuilder, RequestContext};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::structured_query::encode_query_target;
use crate::platform::runtime::sleep as runtime_sleep;
use crate::platform::token::EmptyTokenProvider;

use super::{Datastore, TokenProviderArc};

/// [`Datastore`] backed by the REST endpoints.
#[derive(Clone)]
pub struct HttpDatastore {
    connection: Connection,
    serializer: JsonProtoSerializer,
    auth_provider: TokenProviderArc,
    app_check_provider: TokenProviderArc,
    retry: RetrySettings,
}

#[derive(Clone)]
pub struct HttpDatastoreBuilder {
    database_id: DatabaseId,
    connection_builder: ConnectionBuilder,
    auth_provider: TokenProviderArc,
    app_check_provider: TokenProviderArc,
    retry: RetrySettings,
}

#[derive(Clone, Debug)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            multiplier: 1.5,
            max_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(20),
        }
    }
}

impl HttpDatastore {
    pub fn builder(database_id: DatabaseId) -> HttpDatastoreBuilder {
        HttpDatastoreBuilder::new(database_id)
    }

    pub fn from_database_id(database_id: DatabaseId) -> FirestoreResult<Self> {
        Self::builder(database_id).build()
    }

    async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> FirestoreResult<T>
    where
        F: FnMut(RequestContext) -> Fut,
        Fut: Future<Output = FirestoreResult<T>>,
    {
        let mut attempt = 0usize;
        loop {
            let context = self.build_request_context().await?;
            match operation(context).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if err.code == FirestoreErrorCode::Unauthenticated {
                        self.auth_provider.invalidate_token();
                        self.app_check_provider.invalidate_token();
                    }
                    if !self.retry.should_retry(attempt, &err) {
                        return Err(err);
                    }
                    let delay = self.retry.backoff_delay(attempt);
                    log::debug!("retrying request after {delay:?}: {err}");
                    runtime_sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn build_request_context(&self) -> FirestoreResult<RequestContext> {
        let auth_token = self.auth_provider.get_token().await?;
        let app_check_token = self.app_check_provider.get_token().await?;
        Ok(RequestContext {
            auth_token,
            app_check_token,
            request_timeout: Some(self.retry.request_timeout),
        })
    }

    async fn post(&self, path: &str, body: JsonValue) -> FirestoreResult<JsonValue> {
        self.execute_with_retry(|context| {
            let body = body.clone();
            async move {
                self.connection
                    .invoke_json(Method::POST, path, Some(body), &context)
                    .await
            }
        })
        .await
    }

    /// Path of a resource name relative to the database root.
    fn relative_path(&self, resource_name: &str) -> String {
        let database_name = self.serializer.database_name();
        resource_name
            .strip_prefix(database_name.as_str())
            .unwrap_or(resource_name)
            .trim_start_matches('/')
            .to_string()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Datastore for HttpDatastore {
    async fn commit(&self, mutations: &[Mutation]) -> FirestoreResult<Vec<MutationResult>> {
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect();
        let response = self.post("documents:commit", json!({ "writes": writes })).await?;

        let commit_version = self.serializer.decode_version(response.get("commitTime"))?;
        let results = self
            .serializer
            .decode_write_results(response.get("writeResults"), commit_version)?;
        if results.len() != mutations.len() && !results.is_empty() {
            return Err(internal_error(format!(
                "commit returned {} results for {} writes",
                results.len(),
                mutations.len()
            )));
        }
        if results.is_empty() {
            return Ok(mutations
                .iter()
                .map(|_| MutationResult::new(commit_version, Vec::new()))
                .collect());
        }
        Ok(results)
    }

    async fn batch_get_documents(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<String> = keys.iter().map(|key| self.serializer.document_name(key)).collect();
        let response = self.post("documents:batchGet", json!({ "documents": names })).await?;
        let entries = response
            .as_array()
            .ok_or_else(|| internal_error("batchGet response must be an array"))?;

        let mut by_key = HashMap::with_capacity(entries.len());
        for entry in entries {
            let document = self.serializer.decode_maybe_document(entry)?;
            by_key.insert(document.key().clone(), document);
        }

        let mut documents = Vec::with_capacity(keys.len());
        for key in keys {
            let document = by_key
                .remove(key)
                .ok_or_else(|| internal_error(format!("batchGet response is missing {}", key.path().canonical_string())))?;
            documents.push(document);
        }
        Ok(documents)
    }

    async fn run_query(&self, query: &Query) -> FirestoreResult<Vec<MutableDocument>> {
        let mut encoded = encode_query_target(&self.serializer, &query.to_target());
        let parent = encoded
            .get("parent")
            .and_then(JsonValue::as_str)
            .map(|parent| self.relative_path(parent))
            .ok_or_else(|| internal_error("encoded query has no parent"))?;
        let structured_query = encoded
            .get_mut("structuredQuery")
            .map(JsonValue::take)
            .ok_or_else(|| internal_error("encoded query has no structuredQuery"))?;

        let path = format!("{parent}:runQuery");
        let response = self
            .post(&path, json!({ "structuredQuery": structured_query }))
            .await?;
        let entries = response
            .as_array()
            .ok_or_else(|| internal_error("runQuery response must be an array"))?;

        let mut documents = Vec::new();
        for entry in entries {
            let Some(document) = entry.get("document") else {
                continue;
            };
            let mut decoded = self.serializer.decode_document(document)?;
            let read_time = self.serializer.decode_version(entry.get("readTime"))?;
            decoded.set_read_time(read_time);
            documents.push(decoded);
        }
        Ok(documents)
    }
}

impl HttpDatastoreBuilder {
    fn new(database_id: DatabaseId) -> Self {
        let auth_provider: TokenProviderArc = Arc::new(EmptyTokenProvider);
        let app_check_provider: TokenProviderArc = Arc::new(EmptyTokenProvider);
        let connection_builder = Connection::builder(database_id.clone());
        Self {
            database_id,
            connection_builder,
            auth_provider,
            app_check_provider,
            retry: RetrySettings::default(),
        }
    }

    pub fn with_auth_provider(mut self, provider: TokenProviderArc) -> Self {
        self.auth_provider = provider;
        self
    }

    pub fn with_app_check_provider(mut self, provider: TokenProviderArc) -> Self {
        self.app_check_provider = provider;
        self
    }

    pub fn with_retry_settings(mut self, settings: RetrySettings) -> Self {
        self.retry = settings;
        self
    }

    pub fn with_connection_builder(mut self, builder: ConnectionBuilder) -> Self {
        self.connection_builder = builder;
        self
    }

    pub fn build(self) -> FirestoreResult<HttpDatastore> {
        let connection = self.connection_builder.build()?;
        Ok(HttpDatastore {
            connection,
            serializer: JsonProtoSerializer::new(self.database_id),
            auth_provider: self.auth_provider,
            app_check_provider: self.app_check_provider,
            retry: self.retry,
        })
    }
}

impl RetrySettings {
    fn should_retry(&self, attempt: usize, error: &FirestoreError) -> bool {
        if attempt + 1 >= self.max_attempts {
            return false;
        }

        matches!(
            error.code,
            FirestoreErrorCode::Internal
                | FirestoreErrorCode::Unavailable
                | FirestoreErrorCode::DeadlineExceeded
                | FirestoreErrorCode::ResourceExhausted
                | FirestoreErrorCode::Unauthenticated
        )
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = self.initial_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}
