//! The ephemeral artifact server.
//!
//! Serves the bootstrap document (and anything else under the http
//! directory) to the installer for the duration of one build. The port is
//! only known after [`ArtifactServer::start`] and is substituted into the
//! boot command before injection.

mod files;

use crate::cancellation::CancellationToken;
use crate::config::HttpConfig;
use axum::Router;
use files::{serve_file, FileRoot};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `stop` waits for in-flight requests.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Errors raised by the artifact server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServerError {
    /// The root directory is unusable.
    #[error("invalid http directory {path}: {reason}")]
    InvalidRoot {
        /// The directory.
        path: String,
        /// Why.
        reason: String,
    },

    /// Binding failed for a reason other than the port being taken.
    #[error("bind to {addr} failed: {reason}")]
    BindFailed {
        /// Address tried.
        addr: String,
        /// Why.
        reason: String,
    },

    /// Every port in the range was taken.
    #[error("no free port in {min}-{max} on {bind}")]
    NoFreePort {
        /// Bind address.
        bind: String,
        /// Lowest port.
        min: u16,
        /// Highest port.
        max: u16,
    },

    /// The serving task ended abnormally.
    #[error("server task failed: {0}")]
    Stopped(String),
}

/// Where and what to serve.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory to serve.
    pub root: PathBuf,
    /// Address to bind.
    pub bind_address: String,
    /// Lowest candidate port; `0` with `port_max` `0` means any port.
    pub port_min: u16,
    /// Highest candidate port.
    pub port_max: u16,
    /// Host to advertise instead of a detected one.
    pub advertise_host: Option<String>,
}

impl From<&HttpConfig> for ServerConfig {
    fn from(http: &HttpConfig) -> Self {
        Self {
            root: http.directory.clone(),
            bind_address: http.bind_address.clone(),
            port_min: http.port_min,
            port_max: http.port_max,
            advertise_host: http.advertise_host.clone(),
        }
    }
}

impl ServerConfig {
    /// Serves `root` on any free loopback port.
    #[must_use]
    pub fn loopback(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bind_address: "127.0.0.1".to_string(),
            port_min: 0,
            port_max: 0,
            advertise_host: None,
        }
    }
}

/// A running artifact server.
#[derive(Debug)]
pub struct ArtifactServer {
    local_addr: SocketAddr,
    host: String,
    state: Arc<FileRoot>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl ArtifactServer {
    /// Binds a port and starts serving in the background.
    ///
    /// The server also stops when `cancel` fires.
    pub async fn start(
        config: &ServerConfig,
        cancel: Arc<CancellationToken>,
    ) -> Result<Self, ServerError> {
        let root = tokio::fs::canonicalize(&config.root)
            .await
            .map_err(|e| ServerError::InvalidRoot {
                path: config.root.display().to_string(),
                reason: e.to_string(),
            })?;

        let listener = bind(config).await?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::BindFailed {
            addr: config.bind_address.clone(),
            reason: e.to_string(),
        })?;
        let host = advertised_host(config, local_addr.ip());

        let state = Arc::new(FileRoot::new(root));
        let app = Router::new()
            .fallback(serve_file)
            .with_state(Arc::clone(&state));

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    tokio::select! {
                        _ = rx => {}
                        () = cancel.cancelled() => debug!("Artifact server observed cancellation"),
                    }
                })
                .await
        });

        info!(
            bind = %local_addr,
            advertised = %format!("{host}:{}", local_addr.port()),
            root = %state.root.display(),
            "Artifact server started"
        );

        Ok(Self {
            local_addr,
            host,
            state,
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    /// The host the guest should use.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The bound socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of requests received.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.state.requests.load(Ordering::Relaxed)
    }

    /// Number of files served.
    #[must_use]
    pub fn files_served(&self) -> u64 {
        self.state.served.load(Ordering::Relaxed)
    }

    /// Returns true until [`stop`](Self::stop) was called or the task ended.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops serving and waits for the task. Calling it twice is a no-op.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };

        let result = match tokio::time::timeout(STOP_GRACE, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ServerError::Stopped(e.to_string())),
            Ok(Err(join)) => Err(ServerError::Stopped(join.to_string())),
            Err(_) => {
                warn!("Artifact server did not stop in time; aborting");
                task.abort();
                Ok(())
            }
        };
        info!(
            port = self.port(),
            requests = self.requests(),
            files_served = self.files_served(),
            "Artifact server stopped"
        );
        result
    }
}

impl Drop for ArtifactServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn bind(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let bind = config.bind_address.as_str();
    if config.port_min == 0 && config.port_max == 0 {
        return TcpListener::bind((bind, 0))
            .await
            .map_err(|e| ServerError::BindFailed {
                addr: format!("{bind}:0"),
                reason: e.to_string(),
            });
    }

    let min = config.port_min.max(1);
    let span = u32::from(config.port_max.saturating_sub(min)) + 1;
    let offset = rand::thread_rng().gen_range(0..span);

    for i in 0..span {
        let Ok(port) = u16::try_from(u32::from(min) + (offset + i) % span) else {
            continue;
        };
        match TcpListener::bind((bind, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                debug!(port, error = %e, "Port unavailable");
            }
            Err(e) => {
                return Err(ServerError::BindFailed {
                    addr: format!("{bind}:{port}"),
                    reason: e.to_string(),
                })
            }
        }
    }

    Err(ServerError::NoFreePort {
        bind: bind.to_string(),
        min: config.port_min,
        max: config.port_max,
    })
}

/// Picks the host the guest should connect to.
fn advertised_host(config: &ServerConfig, bound: IpAddr) -> String {
    if let Some(ref host) = config.advertise_host {
        return host.clone();
    }
    if !bound.is_unspecified() {
        return bound.to_string();
    }
    outbound_ip().map_or_else(|| Ipv4Addr::LOCALHOST.to_string(), |ip| ip.to_string())
}

/// The address of the interface holding the default route.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
