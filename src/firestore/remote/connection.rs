use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value as JsonValue;

use crate::firestore::error::{internal_error, unavailable, FirestoreResult};
use crate::firestore::model::DatabaseId;

use super::rpc_error::map_http_error;

const FIRESTORE_API_HOST: &str = "https://firestore.googleapis.com";
const FIRESTORE_API_VERSION: &str = "v1";
const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";
const REQUEST_PARAMS_HEADER: &str = "x-goog-request-params";

/// REST transport rooted at one database.
#[derive(Clone, Debug)]
pub struct Connection {
    client: Client,
    base_url: String,
    database_name: String,
}

#[derive(Clone, Debug)]
pub struct ConnectionBuilder {
    database_id: DatabaseId,
    client: Option<Client>,
    host: Option<String>,
    ssl: bool,
}

/// Per-request credentials and limits.
#[derive(Default, Clone, Debug)]
pub struct RequestContext {
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
    pub request_timeout: Option<Duration>,
}

impl ConnectionBuilder {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            client: None,
            host: std::env::var("FIRESTORE_EMULATOR_HOST").ok(),
            ssl: false,
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Targets a plain-HTTP host such as the emulator.
    pub fn with_emulator_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self.ssl = false;
        self
    }

    /// Targets a custom host. `ssl` picks the scheme.
    pub fn with_host(mut self, host: impl Into<String>, ssl: bool) -> Self {
        self.host = Some(host.into());
        self.ssl = ssl;
        self
    }

    pub fn build(self) -> FirestoreResult<Connection> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .build()
                .map_err(|err| internal_error(err.to_string()))?,
        };
        let host = match self.host {
            Some(host) => format!("{}://{host}", if self.ssl { "https" } else { "http" }),
            None => FIRESTORE_API_HOST.to_string(),
        };
        let database_name = self.database_id.canonical_name();
        let base_url = format!("{host}/{FIRESTORE_API_VERSION}/{database_name}");
        Ok(Connection {
            client,
            base_url,
            database_name,
        })
    }
}

impl Connection {
    pub fn builder(database_id: DatabaseId) -> ConnectionBuilder {
        ConnectionBuilder::new(database_id)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issues a JSON request against `path`, relative to the database root.
    /// Non-2xx responses become `FirestoreError`s, transport failures
    /// become `Unavailable`.
    pub async fn invoke_json(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
        context: &RequestContext,
    ) -> FirestoreResult<JsonValue> {
        let mut request = self.build_request(method, path, context);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| unavailable(format!("request failed: {err}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| unavailable(format!("failed to read response: {err}")))?;
        if !status.is_success() {
            log::debug!("request to {path} failed with status {status}");
            return Err(map_http_error(status, &text));
        }
        if text.is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_str(&text).map_err(|err| internal_error(format!("malformed response: {err}")))
    }

    fn build_request(&self, method: Method, path: &str, context: &RequestContext) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut builder = self.client.request(method, url);
        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Some(timeout) = context.request_timeout {
                builder = builder.timeout(timeout);
            }
        }
        if let Some(token) = context.auth_token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        if let Some(app_check) = context.app_check_token.as_deref() {
            builder = builder.header("X-Firebase-AppCheck", app_check);
        }
        builder
            .header(RESOURCE_PREFIX_HEADER, self.database_name.as_str())
            .header(REQUEST_PARAMS_HEADER, format!("database={}", self.database_name))
            .header("Content-Type", "application/json")
    }
}
