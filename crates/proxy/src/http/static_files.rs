//! Static file serving for routes with a `static_dir`.
//!
//! Lookup order: the exact file, then `index.html` for directory paths,
//! then the directory's `index.html` as an SPA fallback for GET/HEAD
//! requests that don't look like asset fetches. A miss returns `None` so
//! the caller can fall back to the route's upstreams.

use http::{header, Method, Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, trace};

use crate::body::{self, ProxyBody};

/// Try to serve `request_path` from `dir`. `None` means not found (or not a
/// file-serving method) and the caller should continue down the pipeline.
pub async fn serve_static(
    dir: &str,
    request_path: &str,
    method: &Method,
) -> Option<Response<ProxyBody>> {
    if method != Method::GET && method != Method::HEAD {
        return None;
    }

    let root = Path::new(dir);
    let relative = sanitize(request_path)?;

    let exact = root.join(&relative);
    if let Some(resp) = try_file(&exact, method).await {
        return Some(resp);
    }

    // Directory paths get their index.html.
    if let Ok(meta) = fs::metadata(&exact).await {
        if meta.is_dir() {
            if let Some(resp) = try_file(&exact.join("index.html"), method).await {
                return Some(resp);
            }
        }
    }

    // SPA fallback: virtual routes reload to the app shell.
    if !is_asset_path(request_path) {
        if let Some(resp) = try_file(&root.join("index.html"), method).await {
            trace!(path = %request_path, "served SPA fallback");
            return Some(resp);
        }
    }

    None
}

/// Reject traversal and absolute components; returns the cleaned relative
/// path.
fn sanitize(request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    let mut cleaned = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            // ".." or drive/root prefixes never escape the static root.
            _ => return None,
        }
    }
    Some(cleaned)
}

fn is_asset_path(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .map(|last| last.contains('.'))
        .unwrap_or(false)
        || path.starts_with("/assets/")
        || path.starts_with("/static/")
}

async fn try_file(path: &Path, method: &Method) -> Option<Response<ProxyBody>> {
    let meta = fs::metadata(path).await.ok()?;
    if !meta.is_file() {
        return None;
    }

    let content_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, meta.len());

    if let Ok(modified) = meta.modified() {
        builder = builder.header(header::LAST_MODIFIED, httpdate::fmt_http_date(modified));
    }

    let response = if method == Method::HEAD {
        builder.body(body::empty()).ok()?
    } else {
        let content = fs::read(path).await.ok()?;
        debug!(file = %path.display(), bytes = content.len(), "served static file");
        builder.body(body::full(content)).ok()?
    };

    Some(response)
}
