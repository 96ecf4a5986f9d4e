//! REST client for a hosted bookmarks table.
//!
//! Speaks the PostgREST dialect: filters go in the query string
//! (`user_id=eq.<id>`), writes ask for `Prefer: return=representation` so the
//! stored row comes back with its server-assigned id and timestamp. Row-level
//! access control is enforced by the backend; the owner filters sent here only
//! narrow the request.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::BookmarkStore;
use crate::services::auth::AccessToken;
use crate::types::bookmark::{Bookmark, NewBookmark};
use crate::types::errors::StoreError;
use crate::types::session::UserId;

const TABLE_PATH: &str = "rest/v1/bookmarks";

/// Error body returned by PostgREST.
#[derive(Debug, Default, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Bookmark store over HTTP.
pub struct RestStore {
    client: Client,
    base_url: Url,
    anon_key: String,
    access_token: AccessToken,
}

impl RestStore {
    /// Builds a client for `base_url` authenticated as the holder of `access_token`.
    pub fn new(
        base_url: &str,
        anon_key: &str,
        access_token: AccessToken,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let base_url = parse_base_url(base_url)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Connectivity(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            anon_key: anon_key.to_string(),
            access_token,
        })
    }

    /// `GET` target: the caller's rows, newest first.
    pub fn list_url(&self, user: &UserId) -> Url {
        let mut url = self.table_url();
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("user_id", &format!("eq.{}", user))
            .append_pair("order", "created_at.desc");
        url
    }

    /// `POST` target for inserts.
    pub fn insert_url(&self) -> Url {
        let mut url = self.table_url();
        url.query_pairs_mut().append_pair("select", "*");
        url
    }

    /// `DELETE` target for one of the caller's rows.
    pub fn delete_url(&self, user: &UserId, id: &str) -> Url {
        let mut url = self.table_url();
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{}", id))
            .append_pair("user_id", &format!("eq.{}", user));
        url
    }

    /// Headers sent on every request.
    pub fn headers(&self) -> Result<HeaderMap, StoreError> {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", header_value(&self.anon_key)?);
        let mut bearer = header_value(&format!("Bearer {}", self.access_token.expose()))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    fn table_url(&self) -> Url {
        // `parse_base_url` guarantees a trailing slash, so `join` appends.
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.join(TABLE_PATH).unwrap_or(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = request
            .headers(self.headers()?)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = map_status(status, &body);
        warn!(%status, error = %err, "bookmark store request failed");
        Err(err)
    }
}

#[async_trait]
impl BookmarkStore for RestStore {
    async fn list(&self, user: &UserId) -> Result<Vec<Bookmark>, StoreError> {
        let response = self.send(self.client.get(self.list_url(user))).await?;
        let rows: Vec<Bookmark> = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(format!("invalid list response: {}", e)))?;
        debug!(user = %user, count = rows.len(), "listed bookmarks");
        Ok(rows)
    }

    async fn create(&self, user: &UserId, url: &str, title: &str) -> Result<Bookmark, StoreError> {
        let body = NewBookmark {
            user_id: user.as_str().to_string(),
            url: url.to_string(),
            title: title.to_string(),
        };
        let request = self
            .client
            .post(self.insert_url())
            .header("Prefer", "return=representation")
            .json(&body);
        let response = self.send(request).await?;
        let mut rows: Vec<Bookmark> = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(format!("invalid insert response: {}", e)))?;
        if rows.is_empty() {
            return Err(StoreError::Backend("insert returned no row".to_string()));
        }
        let bookmark = rows.swap_remove(0);
        debug!(user = %user, id = %bookmark.id, "created bookmark");
        Ok(bookmark)
    }

    async fn delete(&self, user: &UserId, id: &str) -> Result<(), StoreError> {
        let request = self
            .client
            .delete(self.delete_url(user, id))
            .header("Prefer", "return=representation");
        let response = self.send(request).await?;
        let rows: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(format!("invalid delete response: {}", e)))?;
        // Row-level security hides rows the caller does not own, so "not
        // mine" and "missing" are indistinguishable here.
        if rows.is_empty() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        debug!(user = %user, id, "deleted bookmark");
        Ok(())
    }
}

/// Normalizes the backend base URL so relative joins append to its path.
pub fn parse_base_url(raw: &str) -> Result<Url, StoreError> {
    let mut url = Url::parse(raw).map_err(|e| StoreError::Connectivity(format!("bad backend url '{}': {}", raw, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Maps a non-success HTTP response to a store error.
pub fn map_status(status: StatusCode, body: &str) -> StoreError {
    let parsed: PostgrestError = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .clone()
        .unwrap_or_else(|| if body.is_empty() { status.to_string() } else { body.to_string() });

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized(message),
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::CONFLICT => StoreError::Constraint(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT | StatusCode::SERVICE_UNAVAILABLE => {
            StoreError::Connectivity(message)
        }
        // Postgres class 23 is integrity constraint violation.
        _ if parsed.code.as_deref().is_some_and(|c| c.starts_with("23")) => StoreError::Constraint(message),
        _ => StoreError::Backend(message),
    }
}

fn map_transport_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        StoreError::Connectivity(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

fn header_value(raw: &str) -> Result<HeaderValue, StoreError> {
    HeaderValue::from_str(raw).map_err(|e| StoreError::Unauthorized(format!("unusable credential: {}", e)))
}
