use crate::admin;
use crate::cache::{cache_key, CacheEntry, CacheStore, Params};
use crate::config::Settings;
use crate::fetcher::OriginFetcher;
use crate::protocol::{self, parse_params, split_target, Request, Response};
use crate::session::SessionRegistry;
use crate::util::Result;

use http::{Method, StatusCode};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// shared state handed to every connection task
pub struct AppState {
    pub settings: Arc<Settings>,
    pub cache: Arc<CacheStore>,
    pub sessions: Arc<SessionRegistry>,
    pub fetcher: OriginFetcher,
}

/// receiving side of the shutdown flag flipped by the console's `exit`
#[derive(Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (tx, ShutdownSignal(rx))
}

impl ShutdownSignal {
    /// resolves once shutdown was requested. a dropped sender never resolves it.
    pub async fn wait(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(test)]
    pub fn is_requested(&self) -> bool {
        *self.0.borrow()
    }
}

/// client identity: user agent, peer ip and peer port. two connections from
/// the same browser on different ports count as different clients.
pub fn client_identity(user_agent: Option<&str>, peer: SocketAddr) -> String {
    format!("{}-{}-{}", user_agent.unwrap_or(""), peer.ip(), peer.port())
}

/// a response is dynamic when it depends on input: posted, parameterised,
/// queried, or served from a path containing one of the configured keywords
pub fn is_dynamic(
    method: &Method,
    path: &str,
    had_query: bool,
    params: &Params,
    keywords: &[String],
) -> bool {
    *method == Method::POST
        || !params.is_empty()
        || had_query
        || keywords.iter().any(|k| path.contains(k.as_str()))
}

/// handles exactly one request on `stream` and closes it. malformed request
/// lines close the connection without a response.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, state: &AppState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let request = match protocol::read_request(&mut reader).await? {
        Some(request) => request,
        None => return Ok(()),
    };

    let start_time = Instant::now();
    let method = request.method.clone();
    let target = request.target.clone();
    let (response, cached) = process_request(request, peer, state).await;

    protocol::write_response(&mut writer, &response).await?;
    writer.shutdown().await?;

    info!(
        "{} {} -> {} {}ms{}",
        method,
        target,
        response.status,
        start_time.elapsed().as_millis(),
        if cached { " (cached)" } else { "" }
    );
    Ok(())
}

/// runs the cache pipeline for one parsed request. the flag is true when the
/// response came from the cache.
async fn process_request(request: Request, peer: SocketAddr, state: &AppState) -> (Response, bool) {
    let client_id = client_identity(request.header("user-agent"), peer);
    state.cache.ensure_bucket(&client_id);

    let (path, query) = split_target(&request.target);
    let mut params = Params::new();
    if let Some(query) = query {
        parse_params(query, &mut params);
    }
    // body fields overwrite query fields of the same name
    if let Some(body) = &request.body {
        parse_params(body, &mut params);
    }

    let cookie_name = state.settings.session_cookie();
    let session = state.sessions.resolve(request.header("cookie"), cookie_name);
    let key = cache_key(path, &params);

    let (response, cached) = match lookup(state, &client_id, &key, &request.method, &params) {
        Some(entry) => {
            state.cache.record_hit();
            debug!("cache hit for {} ({})", key, client_id);
            (Response::ok(entry.content_type(), entry.content()), true)
        }
        None if admin::is_admin_path(path) => (
            admin::handle(&request.method, path, &params, &state.cache, &state.settings),
            false,
        ),
        None => {
            state.cache.record_miss();
            debug!("cache miss for {} ({})", key, client_id);
            let cookie = format!("{}={}", cookie_name, session.token);
            let response = forward(
                state,
                &client_id,
                key,
                &request.method,
                path,
                query.is_some(),
                params,
                &cookie,
            )
            .await;
            (response, false)
        }
    };

    let response = if session.is_new {
        response.with_header("Set-Cookie", format!("{}={}; Path=/", cookie_name, session.token))
    } else {
        response
    };
    (response, cached)
}

fn lookup(
    state: &AppState,
    client_id: &str,
    key: &str,
    method: &Method,
    params: &Params,
) -> Option<Arc<CacheEntry>> {
    let entry = state.cache.get(client_id, key)?;
    if entry.is_expired(&state.settings) || !entry.matches(method, params) {
        return None;
    }
    Some(entry)
}

/// fetches from the origin and caches a 200 answer. anything else becomes a
/// 404 page and is not cached.
#[allow(clippy::too_many_arguments)]
async fn forward(
    state: &AppState,
    client_id: &str,
    key: String,
    method: &Method,
    path: &str,
    had_query: bool,
    params: Params,
    cookie: &str,
) -> Response {
    let origin_response = match state
        .fetcher
        .fetch_from_origin(method, path, &params, cookie)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            error!("failed to fetch {} from origin: {}", path, e);
            return Response::error(StatusCode::NOT_FOUND, "resource not found on origin");
        }
    };

    if origin_response.status != StatusCode::OK {
        warn!("origin answered {} for {}, not caching", origin_response.status, path);
        return Response::error(StatusCode::NOT_FOUND, "resource not found on origin");
    }

    let content_type = origin_response.content_type.unwrap_or_else(|| {
        mime_guess::from_path(path)
            .first_or_octet_stream()
            .as_ref()
            .to_string()
    });
    let dynamic = is_dynamic(
        method,
        path,
        had_query,
        &params,
        state.settings.dynamic_keywords(),
    );
    debug!(
        "caching {} as {} for {}",
        key,
        if dynamic { "dynamic" } else { "static" },
        client_id
    );

    let response = Response::ok(content_type.clone(), origin_response.body.clone());
    state.cache.insert(
        client_id,
        key,
        CacheEntry::new(origin_response.body, content_type, dynamic, method.clone(), params),
    );
    response
}

/// accepts connections until shutdown is requested, one task per connection.
/// in-flight connections are awaited before returning.
pub async fn run(listener: TcpListener, state: Arc<AppState>, mut shutdown: ShutdownSignal) -> Result<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&state);
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, &state).await {
                            debug!("connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("failed to accept connection: {}", e),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!("connection task panicked: {}", e);
                }
            }
            _ = shutdown.wait() => break,
        }
    }

    drop(listener);
    info!("listener closed, waiting for {} open connections", connections.len());
    while connections.join_next().await.is_some() {}
    Ok(())
}
