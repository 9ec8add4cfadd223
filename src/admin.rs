use http::{Method, StatusCode};
use log::info;
use std::fmt::Write;
use std::time::Instant;

use crate::cache::{CacheStore, Params};
use crate::config::Settings;
use crate::protocol::Response;
use crate::util::escape_html;

pub const LIST_PATH: &str = "/cache/list";
pub const REMOVE_PATH: &str = "/cache/remove";

const LIST_STYLE: &str = "table { width: 100%; border-collapse: collapse; margin-top: 20px; }\
th, td { padding: 10px; border: 1px solid #ddd; text-align: left; }\
th { background-color: #f5f5f5; }\
.remove-btn { background-color: #ff4444; color: white; border: none; padding: 5px 10px; cursor: pointer; }";

pub fn is_admin_path(path: &str) -> bool {
    path == LIST_PATH || path == REMOVE_PATH
}

/// serves the cache management pages
pub fn handle(
    method: &Method,
    path: &str,
    params: &Params,
    cache: &CacheStore,
    settings: &Settings,
) -> Response {
    match path {
        LIST_PATH => render_list(cache, settings),
        REMOVE_PATH if *method == Method::POST => remove_entry(params, cache),
        REMOVE_PATH => Response::error(StatusCode::METHOD_NOT_ALLOWED, "use POST to remove entries"),
        _ => Response::error(StatusCode::NOT_FOUND, "unknown cache management path"),
    }
}

/// html table of every cached entry with its remaining lifetime
pub fn render_list(cache: &CacheStore, settings: &Settings) -> Response {
    let now = Instant::now();
    let mut rows = cache.list_all();
    rows.sort_by(|a, b| (&a.client_id, &a.key).cmp(&(&b.client_id, &b.key)));

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html><head><title>Cache Manager</title><style>");
    html.push_str(LIST_STYLE);
    html.push_str("</style></head><body><h1>Cache Manager</h1><table>");
    html.push_str("<tr><th>URL</th><th>Expires in</th><th>Type</th><th>User ID</th><th>Action</th></tr>");

    for row in &rows {
        let ttl = settings.ttl_for(row.entry.is_dynamic());
        let remaining_secs = row.entry.remaining_ms(now, ttl) / 1000;
        let key = escape_html(&row.key);
        let client_id = escape_html(&row.client_id);
        // writing into a String cannot fail
        let _ = write!(
            html,
            "<tr><td>{key}</td><td>{remaining_secs} seconds</td><td>{kind}</td><td>{client_id}</td>\
             <td><form method='POST' action='{action}'>\
             <input type='hidden' name='url' value='{key}'>\
             <input type='hidden' name='userId' value='{client_id}'>\
             <input type='submit' value='Remove' class='remove-btn'>\
             </form></td></tr>",
            kind = if row.entry.is_dynamic() { "Dynamic" } else { "Static" },
            action = REMOVE_PATH,
        );
    }

    html.push_str("</table></body></html>");
    Response::html(StatusCode::OK, html)
}

/// removes the entry named by the `url` and `userId` form fields
pub fn remove_entry(params: &Params, cache: &CacheStore) -> Response {
    let (Some(key), Some(client_id)) = (params.get("url"), params.get("userId")) else {
        return Response::error(StatusCode::BAD_REQUEST, "missing url or userId");
    };

    let removed = cache.remove(client_id, key);
    info!("cache removal of {} for {} (removed: {})", key, client_id, removed);
    Response::redirect(LIST_PATH)
}
