//! [`HttpClient`] implementation backed by reqwest.

use crate::error::{SyncError, SyncResult};
use crate::http::{CookieJar, HttpClient, HttpRequest, HttpResponse, Method};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// reqwest-backed HTTP client with a shared cookie jar.
///
/// Cloning is cheap and clones share both the connection pool and cookies.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    cookies: CookieJar,
}

impl ReqwestClient {
    /// Creates a client with a connect timeout suitable for replication.
    ///
    /// No overall request timeout is set: continuous feeds keep their
    /// connection open indefinitely.
    pub fn new() -> SyncResult<Self> {
        let cookies = CookieJar::new();
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(60))
            .cookie_provider(cookies.provider())
            .build()
            .map_err(|e| SyncError::Configuration(format!("failed to build http client: {e}")))?;
        Ok(Self { client, cookies })
    }

    /// The cookie jar shared by all clones.
    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_owned())
                    .and_modify(|existing: &mut String| {
                        existing.push_str(", ");
                        existing.push_str(value);
                    })
                    .or_insert_with(|| value.to_owned());
            }
        }

        let body = response.bytes_stream().map_err(map_reqwest_error).boxed();
        Ok(HttpResponse::new(status, headers, body))
    }

    fn set_cookie(&self, url: &Url, name: &str, value: &str) {
        self.cookies.set(url, name, value);
    }

    fn delete_cookie(&self, url: &Url, name: &str) {
        self.cookies.delete(url, name);
    }
}

fn map_reqwest_error(err: reqwest::Error) -> SyncError {
    if err.is_builder() || err.is_redirect() {
        SyncError::transport_fatal(err.to_string())
    } else {
        SyncError::transport_retryable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_cookies() {
        let client = ReqwestClient::new().unwrap();
        let clone = client.clone();
        let url = Url::parse("http://example.com/db").unwrap();

        client.set_cookie(&url, "session", "abc");
        assert_eq!(clone.cookies().get(&url, "session").as_deref(), Some("abc"));

        clone.delete_cookie(&url, "session");
        assert_eq!(client.cookies().get(&url, "session"), None);
    }

    #[test]
    fn session_cookie_is_scoped_to_its_path() {
        let client = ReqwestClient::new().unwrap();
        let db = Url::parse("http://example.com/db/_session").unwrap();
        client.cookies().store_set_cookie(&db, "AuthSession=xyz; Path=/db; HttpOnly");

        let changes = Url::parse("http://example.com/db/_changes").unwrap();
        assert_eq!(client.cookies().header_for(&changes).as_deref(), Some("AuthSession=xyz"));
        let other = Url::parse("http://example.com/otherdb/_changes").unwrap();
        assert_eq!(client.cookies().header_for(&other), None);
    }

    #[tokio::test]
    async fn connection_refused_is_retryable() {
        let client = ReqwestClient::new().unwrap();
        let url = Url::parse("http://127.0.0.1:9/db").unwrap();
        let err = client.send(HttpRequest::get(url)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
