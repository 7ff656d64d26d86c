//! Read-only file handler for the artifact server.

use crate::utils::paths::is_contained_relative;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Shared state of one server.
#[derive(Debug)]
pub(crate) struct FileRoot {
    /// Canonical root directory.
    pub root: PathBuf,
    /// Requests answered, any status.
    pub requests: AtomicU64,
    /// Requests answered with a file.
    pub served: AtomicU64,
}

impl FileRoot {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            requests: AtomicU64::new(0),
            served: AtomicU64::new(0),
        }
    }
}

/// Serves `GET`/`HEAD` for regular files under the root. Everything else is 404.
pub(crate) async fn serve_file(State(state): State<Arc<FileRoot>>, request: Request<Body>) -> Response {
    state.requests.fetch_add(1, Ordering::Relaxed);
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = match method {
        Method::GET | Method::HEAD => match resolve(&state.root, &path).await {
            Some(file) => read(&file).await,
            None => not_found(),
        },
        _ => not_found(),
    };

    if response.status() == StatusCode::OK {
        state.served.fetch_add(1, Ordering::Relaxed);
    }
    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        "Artifact server request"
    );
    response
}

/// Maps a request path to a regular file inside `root`.
///
/// The path is percent-decoded before the containment check, so an
/// encoded `..` is rejected like a literal one.
async fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(request_path).ok()?;
    if decoded.contains('\0') {
        return None;
    }
    let relative = Path::new(decoded.trim_start_matches('/'));
    if relative.as_os_str().is_empty() || !is_contained_relative(relative) {
        return None;
    }
    let canonical = tokio::fs::canonicalize(root.join(relative)).await.ok()?;
    if !canonical.starts_with(root) {
        return None;
    }
    let metadata = tokio::fs::metadata(&canonical).await.ok()?;
    metadata.is_file().then_some(canonical)
}

async fn read(file: &Path) -> Response {
    match tokio::fs::read(file).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type(file)),
                (header::CACHE_CONTROL, "no-store"),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => not_found(),
    }
}

fn content_type(file: &Path) -> &'static str {
    match file.extension().and_then(|e| e.to_str()) {
        Some("cfg" | "ks" | "txt" | "conf" | "seed" | "sh" | "xml" | "yaml" | "yml") => {
            "text/plain; charset=utf-8"
        }
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("http");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("ks.cfg"), "text").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "nope").unwrap();
        let root = std::fs::canonicalize(&root).unwrap();

        assert!(resolve(&root, "/ks.cfg").await.is_some());
        assert!(resolve(&root, "/").await.is_none());
        assert!(resolve(&root, "/../secret.txt").await.is_none());
        assert!(resolve(&root, "/missing.cfg").await.is_none());
        assert!(resolve(&root, "/%2e%2e/secret.txt").await.is_none());
        assert!(resolve(&root, "/ks%00.cfg").await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_decodes_escaped_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rhel 9 ks.cfg"), "text").unwrap();
        std::fs::create_dir(dir.path().join("site")).unwrap();
        std::fs::write(dir.path().join("site").join("ks+cis.cfg"), "text").unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();

        let file = resolve(&root, "/rhel%209%20ks.cfg").await.unwrap();
        assert_eq!(file, root.join("rhel 9 ks.cfg"));
        assert!(resolve(&root, "/site%2Fks%2Bcis.cfg").await.is_some());
        assert!(resolve(&root, "/site/ks+cis.cfg").await.is_some());
        assert!(resolve(&root, "/%ff.cfg").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_rejects_symlink_out_of_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("http");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "nope").unwrap();
        std::os::unix::fs::symlink(dir.path().join("secret.txt"), root.join("link.cfg")).unwrap();
        let root = std::fs::canonicalize(&root).unwrap();

        assert!(resolve(&root, "/link.cfg").await.is_none());
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("ks.cfg")), "text/plain; charset=utf-8");
        assert_eq!(content_type(Path::new("disk.img")), "application/octet-stream");
    }
}
