use reqwest::header::{HeaderMap, LINK};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

const PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum CanvasError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("access forbidden for {url}")]
    Forbidden { url: Url },
    #[error("api returned {status} for {url}: {body}")]
    Api {
        url: Url,
        status: StatusCode,
        body: String,
    },
    #[error("malformed response body from {url}: {source}")]
    Decode {
        url: Url,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// One page of a listing together with the `rel="next"` link, if any.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<Url>,
}

#[derive(Clone)]
pub struct CanvasClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl std::fmt::Debug for CanvasClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasClient")
            .field("base_url", &self.base_url.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

impl CanvasClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, CanvasError> {
        Self::with_http(Client::new(), base_url, token)
    }

    pub fn with_http(
        http: Client,
        base_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, CanvasError> {
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub fn courses_url(&self) -> Result<Url, CanvasError> {
        self.listing_endpoint("/api/v1/courses")
    }

    pub fn folders_url(&self, course_id: u64) -> Result<Url, CanvasError> {
        self.listing_endpoint(&format!("/api/v1/courses/{course_id}/folders"))
    }

    pub fn files_url(&self, folder_id: u64) -> Result<Url, CanvasError> {
        self.listing_endpoint(&format!("/api/v1/folders/{folder_id}/files"))
    }

    /// Fetches one page of a listing. Items come back in whatever order the
    /// server chose; callers must not rely on it.
    pub async fn list_page<T: DeserializeOwned>(&self, url: &Url) -> Result<Page<T>, CanvasError> {
        let response = self
            .http
            .get(url.clone())
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;

        // Rate limit headers (X-Rate-Limit-Remaining, X-Request-Cost) are not acted upon.
        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            return Err(CanvasError::Forbidden { url: url.clone() });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CanvasError::Api {
                url: url.clone(),
                status,
                body,
            });
        }

        let next = parse_next_link(response.headers())
            .map(|href| url.join(href))
            .transpose()?;
        let body = response.bytes().await?;
        let items = serde_json::from_slice(&body).map_err(|source| CanvasError::Decode {
            url: url.clone(),
            source,
        })?;
        tracing::debug!(%url, has_next = next.is_some(), "fetched listing page");

        Ok(Page { items, next })
    }

    /// Starts a content download. File URLs handed out by the listing API are
    /// pre-signed, so no credentials are attached.
    pub async fn download(&self, url: &Url) -> Result<reqwest::Response, CanvasError> {
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(CanvasError::Api {
                url: url.clone(),
                status,
                body,
            })
        }
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn listing_endpoint(&self, path: &str) -> Result<Url, CanvasError> {
        let mut url = self.base_url.join(path)?;
        url.query_pairs_mut()
            .append_pair("per_page", &PAGE_SIZE.to_string());
        Ok(url)
    }
}

impl CanvasError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            CanvasError::Forbidden { .. } => Some(ApiErrorClass::Auth),
            CanvasError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Returns the target of the `rel="next"` entry of a `Link` header.
///
/// Canvas sends `<https://host/api/v1/courses?page=2&per_page=100>; rel="next", <...>; rel="last"`.
pub fn parse_next_link(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|part| {
            let mut target = None;
            let mut is_next = false;
            for segment in part.split(';').map(str::trim) {
                if let Some(inner) = segment
                    .strip_prefix('<')
                    .and_then(|rest| rest.strip_suffix('>'))
                {
                    target = Some(inner);
                } else if let Some(rel) = segment.strip_prefix("rel=") {
                    is_next = rel
                        .trim_matches('"')
                        .split_whitespace()
                        .any(|kind| kind == "next");
                }
            }
            target.filter(|_| is_next)
        })
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Course {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Folder {
    pub id: u64,
    /// `None` for the root folder of a course.
    #[serde(default, deserialize_with = "deserialize_parent_id")]
    pub parent_folder_id: Option<u64>,
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub folders_count: u64,
    #[serde(default)]
    pub files_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct File {
    pub id: u64,
    pub folder_id: u64,
    pub display_name: String,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub url: Url,
}

// Canvas reports the root folder's parent as null; older payloads use 0.
fn deserialize_parent_id<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<u64>::deserialize(deserializer)?;
    Ok(value.filter(|id| *id != 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn link_headers(values: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(LINK, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn parse_next_link_picks_next_entry() {
        let headers = link_headers(&[
            r#"<https://canvas.example/api/v1/courses?page=1&per_page=100>; rel="current", <https://canvas.example/api/v1/courses?page=2&per_page=100>; rel="next", <https://canvas.example/api/v1/courses?page=5&per_page=100>; rel="last""#,
        ]);
        assert_eq!(
            parse_next_link(&headers),
            Some("https://canvas.example/api/v1/courses?page=2&per_page=100")
        );
    }

    #[test]
    fn parse_next_link_absent_on_last_page() {
        let headers = link_headers(&[
            r#"<https://canvas.example/api/v1/courses?page=1>; rel="first", <https://canvas.example/api/v1/courses?page=5>; rel="last""#,
        ]);
        assert_eq!(parse_next_link(&headers), None);
        assert_eq!(parse_next_link(&HeaderMap::new()), None);
    }

    #[test]
    fn parse_next_link_scans_repeated_headers() {
        let headers = link_headers(&[
            r#"<https://canvas.example/a?page=1>; rel="current""#,
            r#"<https://canvas.example/a?page=2>; rel="next""#,
        ]);
        assert_eq!(
            parse_next_link(&headers),
            Some("https://canvas.example/a?page=2")
        );
    }

    #[test]
    fn listing_urls_carry_page_size() {
        let client = CanvasClient::new("https://canvas.example", "token").unwrap();
        assert_eq!(
            client.courses_url().unwrap().as_str(),
            "https://canvas.example/api/v1/courses?per_page=100"
        );
        assert_eq!(
            client.folders_url(7).unwrap().as_str(),
            "https://canvas.example/api/v1/courses/7/folders?per_page=100"
        );
        assert_eq!(
            client.files_url(42).unwrap().as_str(),
            "https://canvas.example/api/v1/folders/42/files?per_page=100"
        );
    }

    #[test]
    fn root_folder_parent_is_none_for_null_and_zero() {
        let null_parent: Folder = serde_json::from_str(
            r#"{"id":1,"parent_folder_id":null,"name":"course files","updated_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let zero_parent: Folder = serde_json::from_str(
            r#"{"id":1,"parent_folder_id":0,"name":"course files","updated_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let child: Folder = serde_json::from_str(
            r#"{"id":2,"parent_folder_id":1,"name":"Week 1","updated_at":"2024-01-01T00:00:00Z","files_count":3}"#,
        )
        .unwrap();

        assert_eq!(null_parent.parent_folder_id, None);
        assert_eq!(zero_parent.parent_folder_id, None);
        assert_eq!(child.parent_folder_id, Some(1));
        assert_eq!(child.files_count, 3);
    }

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::NOT_FOUND),
            ApiErrorClass::Permanent
        );
    }
}
