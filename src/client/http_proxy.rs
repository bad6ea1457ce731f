use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};
use crate::protocol::{HeaderField, Headers, HttpRequest, HttpResponse, RequestId};

/// Upper bound on a single call to the local service, body included.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

const BAD_GATEWAY_MESSAGE: &str = "Bad Gateway - Local service unavailable";

/// Replays relay requests against the local service.
///
/// Every call to [`LocalForwarder::forward`] yields exactly one response:
/// whatever the local service answers is passed through, and a transport
/// failure becomes a synthesized 502.
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    client: Client,
    base_url: String,
}

impl LocalForwarder {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, FORWARD_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn forward(&self, request: HttpRequest) -> HttpResponse {
        match self.send(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("{} {} -> error: {}", request.method, request.path, e);
                bad_gateway(request.request_id)
            }
        }
    }

    fn local_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let url = self.local_url(&request.path);
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TunnelError::InvalidRequest(format!("method '{}'", request.method)))?;

        let mut builder = self
            .client
            .request(method, &url)
            .headers(to_header_map(&request.headers));
        if let Some(body) = request.body_bytes() {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = from_header_map(response.headers());
        let body = response.bytes().await?;

        debug!(
            "{} {} -> {} {}",
            request.method,
            request.path,
            status,
            body.len()
        );

        let body = if body.is_empty() {
            None
        } else {
            Some(body.to_vec())
        };

        Ok(HttpResponse::new(
            request.request_id.clone(),
            status,
            headers,
            body,
        ))
    }
}

/// The response sent when the local service could not be reached at all.
pub fn bad_gateway(request_id: RequestId) -> HttpResponse {
    let mut headers = Headers::new();
    headers.insert(
        "Content-Type".to_string(),
        HeaderField::One("application/json".to_string()),
    );
    let body = serde_json::json!({ "error": BAD_GATEWAY_MESSAGE }).to_string();

    HttpResponse::new(request_id, 502, headers, Some(body.into_bytes()))
}

/// Connection-scoped headers describe the relay hop, not the message.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
            | "host"
    )
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut header_map = HeaderMap::with_capacity(headers.len());
    for (name, field) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!("Skipping invalid header name: {}", name);
            continue;
        };
        for value in field.values() {
            if let Ok(header_value) = HeaderValue::from_str(value) {
                header_map.append(header_name.clone(), header_value);
            }
        }
    }
    header_map
}

fn from_header_map(header_map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in header_map {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        let value = value.to_string();
        match headers.get_mut(name.as_str()) {
            Some(field) => field.push(value),
            None => {
                headers.insert(name.as_str().to_string(), HeaderField::One(value));
            }
        }
    }
    headers
}
