//! minimal http/1.0 style wire handling: one request in, one response out,
//! then the connection is closed. no chunked bodies, no keep-alive.

use http::{Method, StatusCode};
use log::debug;
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::form_urlencoded;

use crate::cache::Params;
use crate::util::Result;

/// a parsed client request. header names are lowercased.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub target: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// reads one request. `Ok(None)` means the request line was absent or
/// malformed and the connection should be closed without a response.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
        (Some(method), Some(target)) => (method, target.to_string()),
        _ => {
            debug!("malformed request line {:?}", line.trim_end());
            return Ok(None);
        }
    };
    let method = match Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            debug!("invalid method {:?}", method);
            return Ok(None);
        }
    };

    let mut headers = HashMap::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        // later duplicates overwrite earlier ones
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let mut body = None;
    if method == Method::POST {
        let length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        if length > 0 {
            // grow with the bytes that actually arrive, never with the announced length
            let mut buf = Vec::new();
            (&mut *reader).take(length as u64).read_to_end(&mut buf).await?;
            if buf.len() < length {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("body ended after {} of {} bytes", buf.len(), length),
                )
                .into());
            }
            body = Some(String::from_utf8_lossy(&buf).into_owned());
        }
    }

    Ok(Some(Request {
        method,
        target,
        headers,
        body,
    }))
}

/// splits `path?query` into the base path and the raw query, if any
pub fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

/// decodes `k=v&k2=v2` into `params`. trailing empty pieces are dropped
/// (`k=v=` reads as `k=v`), then pairs that do not split into exactly a name
/// and a value are skipped. existing keys are overwritten.
pub fn parse_params(input: &str, params: &mut Params) {
    for pair in input.split('&') {
        let mut pieces: Vec<&str> = pair.split('=').collect();
        while pieces.last().is_some_and(|p| p.is_empty()) {
            pieces.pop();
        }
        let [key, value] = pieces[..] else {
            continue;
        };
        let decoded = format!("{}={}", key, value);
        if let Some((key, value)) = form_urlencoded::parse(decoded.as_bytes()).next() {
            params.insert(key.into_owned(), value.into_owned());
        }
    }
}

/// encodes parameters as an `application/x-www-form-urlencoded` body
pub fn encode_params(params: &Params) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn ok(content_type: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: content_type.into(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn html(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/html; charset=UTF-8".to_string(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// small html page describing an error status
    pub fn error(status: StatusCode, message: &str) -> Self {
        let title = status_line(status);
        Self::html(
            status,
            format!(
                "<html><body><h1>{}</h1><p>{}</p></body></html>",
                title,
                crate::util::escape_html(message)
            ),
        )
    }

    pub fn redirect(location: &str) -> Self {
        let mut response = Self::html(StatusCode::FOUND, "");
        response.headers.push(("Location".to_string(), location.to_string()));
        response
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    #[cfg(test)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn status_line(status: StatusCode) -> String {
    format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or(""))
        .trim_end()
        .to_string()
}

/// writes the response and flushes. the caller closes the connection afterwards.
pub async fn write_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status_line(response.status),
        response.content_type,
        response.body.len()
    );
    for (name, value) in &response.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(response.body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(raw: &str) -> Option<Request> {
        let mut reader = BufReader::new(raw.as_bytes());
        read_request(&mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn parses_get_with_headers() {
        let req = parse("GET /search.php?q=rust HTTP/1.1\r\nUser-Agent: tester\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.target, "/search.php?q=rust");
        assert_eq!(req.header("user-agent"), Some("tester"));
        assert_eq!(req.header("USER-AGENT"), Some("tester"));
        assert!(req.body.is_none());
    }

    #[tokio::test]
    async fn duplicate_headers_overwrite_case_insensitively() {
        let req = parse("GET / HTTP/1.0\r\nX-Thing: one\r\nx-thing: two\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.header("x-thing"), Some("two"));
        assert_eq!(req.headers.len(), 1);
    }

    #[tokio::test]
    async fn reads_post_body_by_content_length() {
        let req = parse("POST /submit.php HTTP/1.1\r\nContent-Length: 8\r\n\r\nname=Annextra")
            .await
            .unwrap();
        assert_eq!(req.body.as_deref(), Some("name=Ann"));
    }

    #[tokio::test]
    async fn get_body_is_ignored() {
        let req = parse("GET / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc").await.unwrap();
        assert!(req.body.is_none());
    }

    #[tokio::test]
    async fn short_body_is_an_error() {
        let mut reader = BufReader::new("POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc".as_bytes());
        assert!(read_request(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn huge_content_length_fails_without_allocating_it() {
        let mut reader = BufReader::new(
            "POST /submit.php HTTP/1.1\r\nContent-Length: 100000000000000\r\n\r\nname=Ann".as_bytes(),
        );
        assert!(read_request(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn malformed_request_lines_yield_none() {
        assert!(parse("").await.is_none());
        assert!(parse("\r\n").await.is_none());
        assert!(parse("GET\r\n\r\n").await.is_none());
        assert!(parse("G(T / HTTP/1.1\r\n\r\n").await.is_none());
    }

    #[test]
    fn splits_query() {
        assert_eq!(split_target("/a?b=c"), ("/a", Some("b=c")));
        assert_eq!(split_target("/a"), ("/a", None));
        assert_eq!(split_target("/a?"), ("/a", Some("")));
    }

    #[test]
    fn decodes_params_and_skips_malformed_pairs() {
        let mut params = Params::new();
        parse_params("name=Ann+Lee&city=S%C3%A3o%20Paulo&broken&empty=&a=b=c&=anon", &mut params);

        assert_eq!(params.get("name").map(String::as_str), Some("Ann Lee"));
        assert_eq!(params.get("city").map(String::as_str), Some("São Paulo"));
        assert_eq!(params.get("").map(String::as_str), Some("anon"));
        assert!(!params.contains_key("broken"));
        assert!(!params.contains_key("empty"));
        assert!(!params.contains_key("a"));
    }

    #[test]
    fn trailing_equals_are_ignored() {
        let mut params = Params::new();
        parse_params("k=v=&x=y==&=&only==", &mut params);

        assert_eq!(params.get("k").map(String::as_str), Some("v"));
        assert_eq!(params.get("x").map(String::as_str), Some("y"));
        assert!(!params.contains_key("only"));
        assert!(!params.contains_key(""));
    }

    #[test]
    fn later_sources_overwrite_earlier_keys() {
        let mut params = Params::new();
        parse_params("a=query&b=1", &mut params);
        parse_params("a=body", &mut params);
        assert_eq!(params.get("a").map(String::as_str), Some("body"));
        assert_eq!(params.get("b").map(String::as_str), Some("1"));
    }

    #[test]
    fn encodes_form_body() {
        let mut params = Params::new();
        params.insert("name".into(), "Ann Lee".into());
        params.insert("x".into(), "a&b".into());
        assert_eq!(encode_params(&params), "name=Ann+Lee&x=a%26b");
    }

    #[tokio::test]
    async fn writes_status_headers_and_body() {
        let mut out = Vec::new();
        let response = Response::ok("text/plain", "Hello").with_header("Set-Cookie", "sid=1; Path=/");
        write_response(&mut out, &response).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Set-Cookie: sid=1; Path=/\r\n"));
        assert!(text.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn redirect_carries_location() {
        let response = Response::redirect("/cache/list");
        assert_eq!(response.status, StatusCode::FOUND);
        assert_eq!(response.header("location"), Some("/cache/list"));
    }
}
