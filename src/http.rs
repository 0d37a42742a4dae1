//! Blocking HTTP front end over tiny_http.
//!
//! A fixed pool of worker threads pulls requests from one shared listener. Routing is a
//! plain function from request parts to an [`ApiResponse`] so it can be tested without a
//! socket.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tiny_http::{Header, Method, Request, Response, Server};

use crate::normalize::{is_extension_allowed, read_capped};
use crate::services::{AppState, NO_DATA_MESSAGE, load_graphs, load_titles, process_upload};
use crate::types::MessageResponse;

/// Slack on top of `max_upload_bytes` for multipart boundaries and part headers.
const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

pub(crate) const NO_FILE_MESSAGE: &str = "No file uploaded";
pub(crate) const NO_SELECTED_FILE_MESSAGE: &str = "No selected file";
pub(crate) const INVALID_FORMAT_MESSAGE: &str = "Invalid file format";

// ── Responses ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ApiResponse {
    pub(crate) status: u16,
    pub(crate) body: Option<serde_json::Value>,
}

impl ApiResponse {
    fn json<T: Serialize>(status: u16, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(value) => Self {
                status,
                body: Some(value),
            },
            Err(err) => Self::message(500, format!("serialize response: {err}")),
        }
    }

    fn message(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, &MessageResponse::new(message))
    }

    fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
        }
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn cors_headers() -> Vec<Header> {
    [
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
        ("Access-Control-Allow-Headers", "Content-Type"),
    ]
    .iter()
    .filter_map(|(k, v)| header(k, v))
    .collect()
}

// ── Server loop ─────────────────────────────────────────────────────────

pub(crate) fn run_server(state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.bind, state.config.port);
    let server = Server::http(&addr)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("server: {e}")))?;
    let server = Arc::new(server);
    let state = Arc::new(state);
    let last_run = state.store.max_run_number()?;
    tracing::info!(
        addr = %addr,
        workers = state.config.workers,
        db = %state.store.path().display(),
        policy = %state.config.ingestion_policy,
        last_run,
        "listening on http://{addr}"
    );

    let mut handles = Vec::with_capacity(state.config.workers);
    for idx in 0..state.config.workers {
        let server = Arc::clone(&server);
        let state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(format!("http-worker-{idx}"))
            .spawn(move || {
                for request in server.incoming_requests() {
                    handle_request(&state, request);
                }
            })?;
        handles.push(handle);
    }
    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("http worker panicked");
        }
    }
    Ok(())
}

fn handle_request(state: &AppState, mut request: Request) {
    let started = Instant::now();
    let method = request.method().clone();
    let url = request.url().to_string();
    let content_type = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Content-Type"))
        .map(|h| h.value.as_str().to_string());

    let response = if method == Method::Post {
        let limit = state
            .config
            .max_upload_bytes
            .saturating_add(MULTIPART_OVERHEAD_BYTES);
        match read_capped(request.as_reader(), limit) {
            Ok(body) => route(state, &method, &url, content_type.as_deref(), &body),
            Err(err) => ApiResponse::message(err.status_code(), err.to_string()),
        }
    } else {
        route(state, &method, &url, content_type.as_deref(), &[])
    };

    let status = response.status;
    let body = response
        .body
        .map(|b| b.to_string())
        .unwrap_or_default();
    let mut reply = Response::from_string(body).with_status_code(status);
    if response_has_body(status) {
        if let Some(h) = header("Content-Type", "application/json") {
            reply.add_header(h);
        }
    }
    for h in cors_headers() {
        reply.add_header(h);
    }
    if let Err(err) = request.respond(reply) {
        tracing::warn!(error = %err, url = %url, "failed to send response");
    }
    tracing::info!(
        method = %method,
        url = %url,
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
}

fn response_has_body(status: u16) -> bool {
    status != 204
}

// ── Routing ─────────────────────────────────────────────────────────────

pub(crate) fn route(
    state: &AppState,
    method: &Method,
    url: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> ApiResponse {
    let path = url.split('?').next().unwrap_or("/");
    match (method, path) {
        (Method::Options, _) => ApiResponse::no_content(),
        (Method::Get, "/") | (Method::Get, "/graphs") => graphs(state),
        (Method::Get, "/element-titles") => titles(state),
        (Method::Post, "/upload") => upload(state, content_type, body),
        _ => ApiResponse::message(404, "Not found"),
    }
}

fn graphs(state: &AppState) -> ApiResponse {
    match load_graphs(state) {
        Ok(Some(set)) => ApiResponse::json(200, &set),
        Ok(None) => ApiResponse::message(400, NO_DATA_MESSAGE),
        Err(err) => {
            tracing::error!(error = %err, "graph projection failed");
            ApiResponse::message(err.status_code(), err.to_string())
        }
    }
}

fn titles(state: &AppState) -> ApiResponse {
    match load_titles(state) {
        Ok(titles) => ApiResponse::json(200, &titles),
        Err(err) => ApiResponse::message(err.status_code(), err.to_string()),
    }
}

fn upload(state: &AppState, content_type: Option<&str>, body: &[u8]) -> ApiResponse {
    let Some(boundary) = content_type.and_then(multipart_boundary) else {
        return ApiResponse::message(400, NO_FILE_MESSAGE);
    };
    let parts = match parse_multipart(body, &boundary) {
        Ok(parts) => parts,
        Err(reason) => {
            tracing::debug!(reason = %reason, "rejected multipart body");
            return ApiResponse::message(400, NO_FILE_MESSAGE);
        }
    };
    let Some(part) = parts.into_iter().find(|p| p.name.as_deref() == Some("file")) else {
        return ApiResponse::message(400, NO_FILE_MESSAGE);
    };
    let file_name = part.filename.unwrap_or_default();
    if file_name.trim().is_empty() {
        return ApiResponse::message(400, NO_SELECTED_FILE_MESSAGE);
    }
    if !is_extension_allowed(&file_name, &state.config.allowed_extensions) {
        return ApiResponse::message(400, INVALID_FORMAT_MESSAGE);
    }

    match process_upload(state, &file_name, &part.data) {
        Ok(response) => ApiResponse::json(200, &response),
        Err(err) => {
            if err.is_client_error() {
                tracing::warn!(error = %err, file = %file_name, "upload rejected");
            } else {
                tracing::error!(error = %err, file = %file_name, "upload failed");
            }
            ApiResponse::message(err.status_code(), err.to_string())
        }
    }
}

// ── multipart/form-data ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FormPart {
    pub(crate) name: Option<String>,
    pub(crate) filename: Option<String>,
    pub(crate) content_type: Option<String>,
    pub(crate) data: Vec<u8>,
}

/// Extract the boundary from a `multipart/form-data; boundary=...` content type.
pub(crate) fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}

fn find_bytes(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// Split header parameters on `;`, leaving semicolons inside quoted values alone.
fn split_params(value: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (idx, ch) in value.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                params.push(&value[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    params.push(&value[start..]);
    params
}

pub(crate) fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<FormPart>, String> {
    let delimiter = format!("--{boundary}").into_bytes();
    let next_delimiter = format!("\r\n--{boundary}").into_bytes();

    let mut pos = find_bytes(body, &delimiter, 0).ok_or("missing opening boundary")?
        + delimiter.len();
    let mut parts = Vec::new();
    loop {
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        if !body[pos..].starts_with(b"\r\n") {
            return Err("boundary not followed by CRLF".into());
        }
        pos += 2;

        let header_end = find_bytes(body, b"\r\n\r\n", pos).ok_or("unterminated part headers")?;
        let headers = std::str::from_utf8(&body[pos..header_end])
            .map_err(|e| format!("part headers: {e}"))?;
        let data_start = header_end + 4;
        let data_end =
            find_bytes(body, &next_delimiter, data_start).ok_or("missing closing boundary")?;

        let mut part = FormPart {
            data: body[data_start..data_end].to_vec(),
            ..FormPart::default()
        };
        for line in headers.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.eq_ignore_ascii_case("Content-Disposition") {
                for param in split_params(value).into_iter().skip(1) {
                    let Some((k, v)) = param.split_once('=') else {
                        continue;
                    };
                    let v = v.trim().trim_matches('"').to_string();
                    match k.trim().to_ascii_lowercase().as_str() {
                        "name" => part.name = Some(v),
                        "filename" => part.filename = Some(v),
                        _ => {}
                    }
                }
            } else if key.eq_ignore_ascii_case("Content-Type") {
                part.content_type = Some(value.trim().to_string());
            }
        }
        parts.push(part);
        pos = data_end + next_delimiter.len();
    }
}
