//! Cosmos DB document store over the SQL REST API
//!
//! Documents live in one collection partitioned on `/key`, so every
//! single-document operation targets exactly one logical partition and
//! the key is unique by construction. Requests are signed with the account
//! master key.

use std::fmt;

use async_trait::async_trait;
use aws_lc_rs::hmac;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, IF_MATCH};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use mantle_common::model::{ClusterDocument, Secret};
use mantle_common::{Error, Result, StoreErrorKind};

use crate::DocumentStore;

const API_VERSION: &str = "2018-12-31";

/// Connection settings for a Cosmos DB collection
#[derive(Clone)]
pub struct CosmosConfig {
    /// Account name; the endpoint is `https://{account}.documents.azure.com`
    pub account: String,
    /// Database id
    pub database: String,
    /// Collection id
    pub collection: String,
    /// Account master key, base64
    pub master_key: Secret,
}

impl fmt::Debug for CosmosConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CosmosConfig")
            .field("account", &self.account)
            .field("database", &self.database)
            .field("collection", &self.collection)
            .field("master_key", &self.master_key)
            .finish()
    }
}

/// Cosmos DB backed [`DocumentStore`]
pub struct CosmosStore {
    http: reqwest::Client,
    endpoint: String,
    collection_link: String,
    signing_key: hmac::Key,
}

#[derive(Deserialize)]
struct QueryPage {
    #[serde(rename = "Documents")]
    documents: Vec<ClusterDocument>,
}

impl CosmosStore {
    /// Build a store for the configured collection
    pub fn new(http: reqwest::Client, config: &CosmosConfig) -> Result<Self> {
        let key = STANDARD.decode(config.master_key.expose()).map_err(|e| {
            Error::internal_with_context("cosmos", format!("master key is not base64: {}", e))
        })?;
        Ok(Self {
            http,
            endpoint: format!("https://{}.documents.azure.com", config.account),
            collection_link: format!("dbs/{}/colls/{}", config.database, config.collection),
            signing_key: hmac::Key::new(hmac::HMAC_SHA256, &key),
        })
    }

    fn doc_link(&self, id: &str) -> String {
        format!("{}/docs/{}", self.collection_link, id)
    }

    /// Master-key authorization token for one request
    fn authorization(&self, method: &Method, resource_link: &str, date: &str) -> String {
        let payload = format!(
            "{}\ndocs\n{}\n{}\n\n",
            method.as_str().to_lowercase(),
            resource_link,
            date.to_lowercase()
        );
        let sig = STANDARD.encode(hmac::sign(&self.signing_key, payload.as_bytes()).as_ref());
        url_encode(&format!("type=master&ver=1.0&sig={}", sig))
    }

    fn headers(
        &self,
        method: &Method,
        resource_link: &str,
        partition_key: Option<&str>,
    ) -> Result<HeaderMap> {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-date", header_value(&date)?);
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            "authorization",
            header_value(&self.authorization(method, resource_link, &date))?,
        );
        if let Some(pk) = partition_key {
            let pk = serde_json::to_string(&[pk])?;
            headers.insert("x-ms-documentdb-partitionkey", header_value(&pk)?);
        }
        Ok(headers)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        resource_link: &str,
        partition_key: Option<&str>,
        extra: HeaderMap,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let mut headers = self.headers(&method, resource_link, partition_key)?;
        headers.extend(extra);
        let mut request = self
            .http
            .request(method.clone(), format!("{}/{}", self.endpoint, path))
            .headers(headers);
        if let Some(body) = body {
            request = request.body(serde_json::to_vec(&body)?);
        }
        let response = request.send().await.map_err(|e| {
            Error::store(StoreErrorKind::Unavailable, format!("cosmos request failed: {}", e))
        })?;
        debug!(method = %method, path = %path, status = %response.status(), "cosmos response");
        check_status(response).await
    }

    /// Run a SQL query, following continuation tokens
    async fn query(
        &self,
        sql: &str,
        parameters: serde_json::Value,
        partition_key: Option<&str>,
    ) -> Result<Vec<ClusterDocument>> {
        let path = format!("{}/docs", self.collection_link);
        let mut out = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut extra = HeaderMap::new();
            extra.insert(CONTENT_TYPE, HeaderValue::from_static("application/query+json"));
            extra.insert("x-ms-documentdb-isquery", HeaderValue::from_static("True"));
            if partition_key.is_none() {
                extra.insert(
                    "x-ms-documentdb-query-enablecrosspartition",
                    HeaderValue::from_static("True"),
                );
            }
            if let Some(token) = &continuation {
                extra.insert("x-ms-continuation", header_value(token)?);
            }
            let body = json!({ "query": sql, "parameters": parameters });
            let response = self
                .send(
                    Method::POST,
                    &path,
                    &self.collection_link,
                    partition_key,
                    extra,
                    Some(body),
                )
                .await?;
            continuation = response
                .headers()
                .get("x-ms-continuation")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let page: QueryPage = response.json().await.map_err(|e| {
                Error::serialization_for_kind("cosmos query page", e.to_string())
            })?;
            out.extend(page.documents);
            if continuation.is_none() {
                return Ok(out);
            }
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let kind = match status {
        StatusCode::NOT_FOUND => StoreErrorKind::NotFound,
        StatusCode::CONFLICT => StoreErrorKind::Conflict,
        StatusCode::PRECONDITION_FAILED => StoreErrorKind::PreconditionFailed,
        StatusCode::TOO_MANY_REQUESTS => StoreErrorKind::Unavailable,
        s if s.is_server_error() => StoreErrorKind::Unavailable,
        _ => {
            return Err(Error::internal_with_context(
                "cosmos",
                format!("unexpected status {}: {}", status, body),
            ))
        }
    };
    Err(Error::store(kind, format!("cosmos returned {}: {}", status, body)))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::internal_with_context("cosmos", format!("invalid header: {}", e)))
}

/// Percent-encode everything outside the unreserved set
fn url_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn if_match(etag: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(IF_MATCH, header_value(etag)?);
    Ok(headers)
}

#[async_trait]
impl DocumentStore for CosmosStore {
    async fn get(&self, key: &str) -> Result<ClusterDocument> {
        let docs = self
            .query(
                "SELECT * FROM docs WHERE docs.key = @key",
                json!([{ "name": "@key", "value": key }]),
                Some(key),
            )
            .await?;
        docs.into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("no document for key '{}'", key)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ClusterDocument>> {
        let mut docs = self
            .query(
                "SELECT * FROM docs WHERE STARTSWITH(docs.key, @prefix)",
                json!([{ "name": "@prefix", "value": prefix }]),
                None,
            )
            .await?;
        docs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(docs)
    }

    async fn create(&self, doc: ClusterDocument) -> Result<ClusterDocument> {
        let path = format!("{}/docs", self.collection_link);
        let body = serde_json::to_value(&doc)?;
        let response = self
            .send(
                Method::POST,
                &path,
                &self.collection_link,
                Some(&doc.key),
                HeaderMap::new(),
                Some(body),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| Error::serialization_for_kind("cluster document", e.to_string()))
    }

    async fn update(&self, doc: ClusterDocument) -> Result<ClusterDocument> {
        let link = self.doc_link(&doc.id);
        let body = serde_json::to_value(&doc)?;
        let response = self
            .send(
                Method::PUT,
                &link,
                &link,
                Some(&doc.key),
                if_match(&doc.etag)?,
                Some(body),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| Error::serialization_for_kind("cluster document", e.to_string()))
    }

    async fn delete(&self, key: &str, etag: &str) -> Result<()> {
        let doc = self.get(key).await?;
        if doc.etag != etag {
            return Err(Error::precondition_failed(format!(
                "etag {} does not match stored etag for '{}'",
                etag, key
            )));
        }
        let link = self.doc_link(&doc.id);
        self.send(
            Method::DELETE,
            &link,
            &link,
            Some(key),
            if_match(etag)?,
            None,
        )
        .await?;
        Ok(())
    }
}
