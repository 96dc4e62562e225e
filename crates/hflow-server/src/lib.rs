//! hflow server - admin HTTP API.
//!
//! Lets intercepts be installed and removed while the proxy is running, and
//! serves the root certificate clients need to trust.
//!
//! ## Endpoints
//!
//! - `GET /api/intercepts` - List installed intercepts
//! - `POST /api/intercepts` - Install a header rule
//! - `DELETE /api/intercepts/{id}` - Remove an intercept
//! - `GET /api/ca` - Download the root certificate
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hflow_proxy::{CertificateAuthority, InterceptRegistry};
//! use hflow_server::{AdminConfig, AdminServer, AdminState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let ca = Arc::new(CertificateAuthority::from_embedded().unwrap());
//!     let state = AdminState::new(Arc::new(InterceptRegistry::new()), ca);
//!     let server = AdminServer::new(AdminConfig::default(), state).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::net::SocketAddr;

use axum::routing::{delete, get};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::info;

pub use error::{ApiError, Result};
pub use state::AdminState;

/// Default admin port.
pub const DEFAULT_PORT: u16 = 8079;

/// Default admin host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Admin server configuration.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 8079).
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl AdminConfig {
    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the admin router over `state`.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route(
            "/api/intercepts",
            get(handlers::list_intercepts).post(handlers::add_intercept),
        )
        .route("/api/intercepts/{id}", delete(handlers::remove_intercept))
        .route("/api/ca", get(handlers::root_certificate))
        .with_state(state)
}

/// The admin HTTP server.
pub struct AdminServer {
    router: Router,
    addr: SocketAddr,
}

impl AdminServer {
    /// Creates a server with the given configuration and state.
    pub fn new(config: AdminConfig, state: AdminState) -> std::result::Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self {
            router: router(state),
            addr,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until the process exits.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        info!("Starting hflow admin server on {}", self.addr);

        let domain = if self.addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        // Rebind immediately after a restart even with sockets in TIME_WAIT.
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        axum::serve(listener, self.router)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        Ok(())
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}
