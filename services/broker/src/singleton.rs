//! Singleton election.
//!
//! The broker must be unique per host.  A named guard socket stands in for
//! the original shared-memory key: the first process to bind it wins; a
//! later process finds the name taken and exits without ever opening the
//! request channel.  The guard carries no payload — its existence is the
//! signal.
//!
//! A guard file can outlive a crashed broker.  Liveness is checked by
//! connecting: a refused connection means the owner is gone, so the stale
//! file is reclaimed and the bind retried once.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use sqlapi_protocol::singleton_guard_path;
use tracing::{debug, info};

/// Holds the election for the lifetime of the broker process.
#[derive(Debug)]
pub struct SingletonGuard {
    path: PathBuf,
    _listener: UnixListener,
}

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Try to become the host's broker.  `Ok(None)` means another broker is
/// already running and the caller must exit (with code 0).
pub fn acquire(socket_dir: &Path) -> io::Result<Option<SingletonGuard>> {
    let path = singleton_guard_path(socket_dir);
    match UnixListener::bind(&path) {
        Ok(listener) => {
            info!(path = %path.display(), "singleton guard acquired");
            Ok(Some(SingletonGuard {
                path,
                _listener: listener,
            }))
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            if UnixStream::connect(&path).is_ok() {
                debug!("broker already running");
                return Ok(None);
            }
            // Stale guard from a crashed broker; reclaim it.
            std::fs::remove_file(&path)?;
            let listener = UnixListener::bind(&path)?;
            info!(path = %path.display(), "stale singleton guard reclaimed");
            Ok(Some(SingletonGuard {
                path,
                _listener: listener,
            }))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_loses_the_election() {
        let dir = tempfile::tempdir().unwrap();
        let guard = acquire(dir.path()).unwrap();
        assert!(guard.is_some());
        assert!(acquire(dir.path()).unwrap().is_none());
    }

    #[test]
    fn guard_release_allows_reacquisition() {
        let dir = tempfile::tempdir().unwrap();
        let guard = acquire(dir.path()).unwrap();
        drop(guard);
        assert!(acquire(dir.path()).unwrap().is_some());
    }

    #[test]
    fn stale_guard_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = singleton_guard_path(dir.path());
        // A crash leaves the socket file behind with no one listening.
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        assert!(acquire(dir.path()).unwrap().is_some());
    }
}
