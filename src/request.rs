//! Outbound REST commands and how they are shaped into HTTP.

use crate::config::ResolvedRestConfig;
use crate::error::Error;
use crate::transport::HttpRequest;
use http::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::fmt;

pub const AUDIT_LOG_REASON: &str = "x-audit-log-reason";

/// REST methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    pub fn as_http(self) -> http::Method {
        match self {
            Method::Get => http::Method::GET,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Patch => http::Method::PATCH,
            Method::Delete => http::Method::DELETE,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One REST command.
///
/// ```ignore
/// let request = Request::post("/guilds/1234/channels")
///     .json(json!({ "name": "general" }))
///     .reason("setup");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    path: String,
    payload: Option<Value>,
    audit_reason: Option<String>,
    bucket_key: String,
    pub(crate) attempt: u32,
}

impl Request {
    /// `path` is relative to the versioned API base, e.g. `/channels/123`
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        let bucket_key = route_key(method, &path);
        Self {
            method,
            path,
            payload: None,
            audit_reason: None,
            bucket_key,
            attempt: 0,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Attach a JSON body. Ignored for DELETE.
    pub fn json(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the audit log reason
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.audit_reason = Some(reason.into());
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn audit_reason(&self) -> Option<&str> {
        self.audit_reason.as_deref()
    }

    pub fn bucket_key(&self) -> &str {
        &self.bucket_key
    }

    /// Retries already spent on this request
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Bucket key for a route: method plus the path with ids replaced by `:id`
/// and the query string dropped.
///
/// `DELETE /channels/123` and `DELETE /channels/456` share a key.
pub fn route_key(method: Method, path: &str) -> String {
    let path = path.split('?').next().unwrap_or_default();
    let template: Vec<&str> = path
        .split('/')
        .map(|segment| {
            if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
                ":id"
            } else {
                segment
            }
        })
        .collect();
    format!("{} {}", method, template.join("/"))
}

/// Shape `request` into HTTP against the resolved API base.
///
/// DELETE never carries a body. JSON bodies get `Content-Type:
/// application/json`.
pub fn build_http_request(
    request: &Request,
    config: &ResolvedRestConfig,
) -> Result<HttpRequest, Error> {
    let mut headers = HeaderMap::new();

    let authorization = HeaderValue::from_str(&config.token.authorization())
        .map_err(|_| Error::Auth("token is not a valid header value".to_string()))?;
    headers.insert(AUTHORIZATION, authorization);

    let user_agent = HeaderValue::from_str(&config.user_agent)
        .map_err(|e| Error::Protocol(format!("invalid user agent: {}", e)))?;
    headers.insert(USER_AGENT, user_agent);

    if let Some(reason) = &request.audit_reason {
        let encoded = urlencoding::encode(reason);
        let value = HeaderValue::from_str(&encoded)
            .map_err(|e| Error::Protocol(format!("invalid audit reason: {}", e)))?;
        headers.insert(HeaderName::from_static(AUDIT_LOG_REASON), value);
    }

    let body = match (&request.payload, request.method) {
        (_, Method::Delete) | (None, _) => None,
        (Some(payload), _) => {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Some(serde_json::to_vec(payload)?)
        }
    };

    Ok(HttpRequest {
        method: request.method.as_http(),
        url: format!("{}{}", config.api_base, request.path),
        headers,
        body,
    })
}
