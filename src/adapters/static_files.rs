//! Static file dispatcher: serves files under a root directory through the
//! standard endpoint dispatch path.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use http::{Response, StatusCode, header};

use crate::core::resolver::{DispatchError, Dispatcher, ResolvedRequest};

/// Build a dispatcher serving files from `root`. The endpoint prefix is
/// stripped from the request path before it is resolved inside the root;
/// directory requests fall back to `index.html`.
pub fn static_dir_dispatcher(root: impl AsRef<Path>, prefix: &str) -> Dispatcher {
    let root: Arc<PathBuf> = Arc::new(root.as_ref().to_path_buf());
    let prefix = prefix.to_string();

    Arc::new(move |resolved: ResolvedRequest| {
        let root = root.clone();
        let prefix = prefix.clone();
        Box::pin(async move {
            let request_path = resolved.head.uri.path();
            let relative = request_path
                .strip_prefix(prefix.as_str())
                .unwrap_or(request_path)
                .trim_start_matches('/');

            serve(&root, relative).await
        })
    })
}

async fn serve(root: &Path, relative: &str) -> Result<Response<Bytes>, DispatchError> {
    let full_path = root.join(relative);

    // Reject anything escaping the root once symlinks and `..` resolve.
    let canonical_root = tokio::fs::canonicalize(root)
        .await
        .map_err(|e| DispatchError::Failed(format!("unreadable static root: {e}")))?;
    let canonical_path = match tokio::fs::canonicalize(&full_path).await {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(not_found());
        }
        Err(e) => return Err(DispatchError::Failed(e.to_string())),
    };
    if !canonical_path.starts_with(&canonical_root) {
        tracing::warn!(path = relative, "Path traversal attempt rejected");
        return Ok(not_found());
    }

    let target = if canonical_path.is_dir() {
        canonical_path.join("index.html")
    } else {
        canonical_path
    };

    match tokio::fs::read(&target).await {
        Ok(contents) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type_for(&target))
            .body(Bytes::from(contents))
            .map_err(|e| DispatchError::InvalidResponse(e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(not_found()),
        Err(e) => Err(DispatchError::Failed(e.to_string())),
    }
}

fn not_found() -> Response<Bytes> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Bytes::from_static(b"Not Found"))
        .unwrap_or_else(|_| Response::new(Bytes::new()))
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}
