//! The shared cancellation signal for one VM run.

use tokio_util::sync::CancellationToken;

/// Liveness flag shared by the controller and its monitors.
///
/// Owned by the controller; monitors receive clones and only ever read it.
/// Flipping it (on `Stop` or when the hypervisor exits) is the sole
/// cancellation signal the console stream and readiness monitor observe.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    token: CancellationToken,
}

impl Liveness {
    /// A fresh flag in the alive state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` until [`Liveness::revoke`] is called.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Mark the run as no longer active. Idempotent.
    pub fn revoke(&self) {
        self.token.cancel();
    }

    /// Resolves once the flag has been revoked.
    pub async fn revoked(&self) {
        self.token.cancelled().await;
    }

    /// Sleep for `duration` unless the flag is revoked first.
    ///
    /// Returns `false` if the sleep was cut short.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.token.cancelled() => false,
        }
    }
}
