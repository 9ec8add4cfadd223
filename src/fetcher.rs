use crate::cache::Params;
use crate::config::DEFAULT_ORIGIN_URL;
use crate::protocol::encode_params;
use crate::util::{ProxyError, Result};
use bytes::Bytes;
use http::{header, Method, Request, StatusCode, Uri};
use hyper::client::HttpConnector;
use hyper::{body::to_bytes, Body, Client as HyperClient};
use log::{debug, warn};
use std::sync::Arc;

/// what the origin answered, body fully buffered
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: String,
}

#[derive(Clone)]
pub struct OriginFetcher {
    client: Arc<HyperClient<HttpConnector>>,
    origin_base_url: Arc<str>,
}

impl OriginFetcher {
    pub fn new(origin_url: &str) -> Result<Self> {
        let parsed = url::Url::parse(origin_url).map_err(ProxyError::UrlParse)?;
        if parsed.scheme() != "http" {
            return Err(ProxyError::Config(format!(
                "origin url must use http, got {}",
                parsed.scheme()
            )));
        }

        let client = Arc::new(HyperClient::builder().build(HttpConnector::new()));
        // targets are built as base + path, so a trailing slash would double up
        let origin_base_url = Arc::from(origin_url.trim_end_matches('/'));
        Ok(Self {
            client,
            origin_base_url,
        })
    }

    /// like `new`, but an unusable url is logged and replaced by the default
    /// origin so the proxy still starts
    pub fn new_or_default(origin_url: &str) -> Result<Self> {
        match Self::new(origin_url) {
            Ok(fetcher) => Ok(fetcher),
            Err(e) => {
                warn!(
                    "invalid origin url {:?} ({}), falling back to {}",
                    origin_url, e, DEFAULT_ORIGIN_URL
                );
                Self::new(DEFAULT_ORIGIN_URL)
            }
        }
    }

    pub fn base_url(&self) -> &str {
        &self.origin_base_url
    }

    /// performs one upstream call to `origin_base_url + path`. the session
    /// token travels as a cookie, post parameters as a form body. query
    /// parameters of a get are not forwarded.
    pub async fn fetch_from_origin(
        &self,
        method: &Method,
        path: &str,
        params: &Params,
        cookie: &str,
    ) -> Result<OriginResponse> {
        let target: Uri = format!("{}{}", self.origin_base_url, path).parse()?;

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(target)
            .header(header::COOKIE, cookie);

        let body = if *method == Method::POST && !params.is_empty() {
            builder = builder.header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
            Body::from(encode_params(params))
        } else {
            Body::empty()
        };
        let req = builder.body(body)?;

        debug!("fetching from origin: {} {}", req.method(), req.uri());

        let origin_response = self.client.request(req).await.map_err(ProxyError::Hyper)?;

        let (parts, body) = origin_response.into_parts();
        let body_bytes: Bytes = to_bytes(body).await.map_err(ProxyError::Hyper)?;
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(OriginResponse {
            status: parts.status,
            content_type,
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
        })
    }
}
