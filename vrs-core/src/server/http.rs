//! Static file server for the browser viewer.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::VrsError;

/// Content type for a file name, by extension.
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript; charset=utf-8",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Map a request path onto a file below `root`.
pub fn resolve(root: &Path, request_path: &str) -> Result<PathBuf, StatusCode> {
    if request_path.contains("..") {
        return Err(StatusCode::FORBIDDEN);
    }
    let relative = request_path.trim_start_matches('/');
    let relative = if relative.is_empty() {
        "index.html"
    } else {
        relative
    };
    Ok(root.join(relative))
}

async fn serve_file(State(root): State<Arc<PathBuf>>, uri: Uri) -> Response {
    let path = match resolve(&root, uri.path()) {
        Ok(p) => p,
        Err(status) => {
            warn!(path = uri.path(), "rejected path traversal");
            return status.into_response();
        }
    };
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return StatusCode::NOT_FOUND.into_response(),
    }
    match tokio::fs::read(&path).await {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, mime_type(&path)),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "read failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Serves a directory over plain HTTP on the server runtime.
pub struct StaticFileServer {
    root: PathBuf,
    addr: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl StaticFileServer {
    pub fn new(root: impl Into<PathBuf>, host: &str, port: u16) -> Self {
        Self {
            root: root.into(),
            addr: format!("{host}:{port}"),
            cancel: CancellationToken::new(),
            task: None,
            local_addr: None,
        }
    }

    pub fn router(root: PathBuf) -> Router {
        Router::new()
            .fallback(serve_file)
            .with_state(Arc::new(root))
    }

    /// Bind and start serving on `runtime`. Bind failures are returned.
    pub fn start(&mut self, runtime: &Handle) -> Result<SocketAddr, VrsError> {
        if self.task.is_some() {
            return Err(VrsError::AlreadyRunning);
        }
        let bind_err = |source| VrsError::Bind {
            addr: self.addr.clone(),
            source,
        };
        let std_listener = std::net::TcpListener::bind(&self.addr).map_err(bind_err)?;
        std_listener.set_nonblocking(true).map_err(bind_err)?;
        let local = std_listener.local_addr()?;

        if !self.root.is_dir() {
            warn!(root = %self.root.display(), "web root does not exist; every request will 404");
        }

        let app = Self::router(self.root.clone());
        let shutdown = self.cancel.clone().cancelled_owned();
        self.task = Some(runtime.spawn(async move {
            let listener = match tokio::net::TcpListener::from_std(std_listener) {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "http listener registration failed");
                    return;
                }
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "http server stopped with error");
            }
        }));
        self.local_addr = Some(local);
        info!(addr = %local, root = %self.root.display(), "serving web viewer");
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.local_addr = None;
    }
}

impl Drop for StaticFileServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_maps_to_index() {
        let root = Path::new("/srv/web");
        assert_eq!(resolve(root, "/").unwrap(), root.join("index.html"));
        assert_eq!(resolve(root, "/js/app.js").unwrap(), root.join("js/app.js"));
    }

    #[test]
    fn traversal_is_forbidden() {
        let root = Path::new("/srv/web");
        assert_eq!(resolve(root, "/../etc/passwd"), Err(StatusCode::FORBIDDEN));
        assert_eq!(resolve(root, "/a/..b"), Err(StatusCode::FORBIDDEN));
    }

    #[test]
    fn mime_table() {
        assert_eq!(mime_type(Path::new("index.HTML")), "text/html; charset=utf-8");
        assert_eq!(mime_type(Path::new("a.woff2")), "font/woff2");
        assert_eq!(mime_type(Path::new("photo.jpeg")), "image/jpeg");
        assert_eq!(mime_type(Path::new("blob.bin")), "application/octet-stream");
        assert_eq!(mime_type(Path::new("Makefile")), "application/octet-stream");
    }
}
