//! Shared router state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vos_vm::{VmController, VmLauncher};

/// The controller every handler talks to, plus the token that ends
/// long-lived event streams when the server shuts down.
pub struct AppState<L: VmLauncher> {
    vm: Arc<VmController<L>>,
    shutdown: CancellationToken,
}

impl<L: VmLauncher> AppState<L> {
    #[must_use]
    pub fn new(vm: Arc<VmController<L>>) -> Self {
        Self { vm, shutdown: CancellationToken::new() }
    }

    #[must_use]
    pub fn vm(&self) -> &Arc<VmController<L>> {
        &self.vm
    }

    /// Cancel to close every open `/v1/vm/events` stream.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

// Manual impl: `L` itself need not be `Clone`.
impl<L: VmLauncher> Clone for AppState<L> {
    fn clone(&self) -> Self {
        Self { vm: Arc::clone(&self.vm), shutdown: self.shutdown.clone() }
    }
}
