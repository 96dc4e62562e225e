//! Application state for the admin server.

use std::sync::Arc;

use hflow_proxy::{CertificateAuthority, InterceptRegistry};

/// Shared application state.
#[derive(Clone)]
pub struct AdminState {
    /// Intercepts consulted by the running proxy.
    pub registry: Arc<InterceptRegistry>,
    /// Authority whose root certificate clients must trust.
    pub ca: Arc<CertificateAuthority>,
}

impl AdminState {
    /// Creates state sharing the proxy's registry and authority.
    pub fn new(registry: Arc<InterceptRegistry>, ca: Arc<CertificateAuthority>) -> Self {
        Self { registry, ca }
    }
}
