use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one VM run, from `Start` until the process is reaped.
///
/// Monitor outcomes carry the `RunId` they were spawned for, so an outcome
/// arriving after its run was torn down can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RunId(pub Uuid);

impl RunId {
    /// Creates a new random `RunId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner `Uuid`.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
