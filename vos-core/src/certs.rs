//! The TLS material the guest drops into the shared directory.
//!
//! The guest writes `ca.pem`, `cert.pem` and `key.pem` once its engine has
//! generated client credentials. Their joint presence is the only
//! out-of-band boot signal the guest gives, so a bundle left over from an
//! earlier run must be removed before a new VM starts.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// File name of the CA certificate.
pub const CA_FILE: &str = "ca.pem";

/// File name of the client certificate.
pub const CERT_FILE: &str = "cert.pem";

/// File name of the client private key.
pub const KEY_FILE: &str = "key.pem";

/// Paths of the three certificate files inside a shared directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CertificateBundle {
    /// CA certificate used as the trust anchor for the engine.
    pub ca: PathBuf,
    /// Client certificate presented to the engine.
    pub cert: PathBuf,
    /// Private key matching [`CertificateBundle::cert`].
    pub key: PathBuf,
}

impl CertificateBundle {
    /// The well-known bundle inside `dir`.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            ca: dir.join(CA_FILE),
            cert: dir.join(CERT_FILE),
            key: dir.join(KEY_FILE),
        }
    }

    /// All three paths, CA first.
    #[must_use]
    pub fn paths(&self) -> [&Path; 3] {
        [&self.ca, &self.cert, &self.key]
    }

    /// `true` when all three files exist and are non-empty.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.paths().iter().all(|p| is_non_empty_file(p))
    }

    /// Delete whichever of the three files exist.
    ///
    /// Returns the number of files removed.
    ///
    /// # Errors
    /// Returns the first I/O error other than `NotFound`.
    pub fn remove_stale(&self) -> io::Result<usize> {
        let mut removed = 0;
        for path in self.paths() {
            match std::fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

/// `true` if `path` is a regular file with at least one byte.
#[must_use]
pub fn is_non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        }
    }

    fn write(path: &Path, contents: &str) {
        if let Err(e) = std::fs::write(path, contents) {
            panic!("write {}: {e}", path.display());
        }
    }

    #[test]
    fn bundle_uses_well_known_names() {
        let bundle = CertificateBundle::in_dir(Path::new("/shared"));
        assert_eq!(bundle.ca, Path::new("/shared/ca.pem"));
        assert_eq!(bundle.cert, Path::new("/shared/cert.pem"));
        assert_eq!(bundle.key, Path::new("/shared/key.pem"));
    }

    #[test]
    fn bundle_incomplete_until_all_three_written() {
        let dir = tempdir();
        let bundle = CertificateBundle::in_dir(dir.path());
        assert!(!bundle.is_complete(), "empty dir must not be complete");

        write(&bundle.ca, "ca");
        write(&bundle.cert, "cert");
        assert!(!bundle.is_complete(), "missing key must not be complete");

        write(&bundle.key, "key");
        assert!(bundle.is_complete(), "all three files present must be complete");
    }

    #[test]
    fn bundle_with_empty_file_is_incomplete() {
        let dir = tempdir();
        let bundle = CertificateBundle::in_dir(dir.path());
        write(&bundle.ca, "ca");
        write(&bundle.cert, "cert");
        write(&bundle.key, "");
        assert!(!bundle.is_complete(), "zero-length key must not count");
    }

    #[test]
    fn remove_stale_deletes_present_files_only() {
        let dir = tempdir();
        let bundle = CertificateBundle::in_dir(dir.path());
        write(&bundle.cert, "old");

        let removed = match bundle.remove_stale() {
            Ok(n) => n,
            Err(e) => panic!("remove_stale: {e}"),
        };
        assert_eq!(removed, 1);
        assert!(!bundle.cert.exists(), "stale cert.pem must be gone");

        let again = match bundle.remove_stale() {
            Ok(n) => n,
            Err(e) => panic!("remove_stale: {e}"),
        };
        assert_eq!(again, 0, "second pass must find nothing");
    }
}
