//! Lock coordination over a Unix domain socket
//!
//! Sidecar processes (job runners, maintenance scripts) share the
//! reconciliation lock through a line-oriented protocol on a local
//! socket. One request per line, one reply per line: `ok` or `ko`.
//!
//! Requests:
//! - `lock`            acquire the shared lock, blocks until granted
//! - `unlock`          release the shared lock
//! - `run <action>`    run a registered action under the lock and a
//!                     timeout; a lock the connection already holds is
//!                     reused, one acquired for the action is released
//!                     even when the action fails or times out
//!
//! Anything else gets `ko` and has no side effects.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

// ============================================================================
// Protocol
// ============================================================================

/// Parsed client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockRequest {
    Lock,
    Unlock,
    /// Run a named action while holding the lock
    Action(String),
}

impl LockRequest {
    /// Parse one protocol line. Returns `None` for anything malformed.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        match line {
            "lock" => Some(Self::Lock),
            "unlock" => Some(Self::Unlock),
            _ => {
                let name = line.strip_prefix("run ")?.trim();
                if name.is_empty() {
                    None
                } else {
                    Some(Self::Action(name.to_string()))
                }
            }
        }
    }
}

const REPLY_OK: &[u8] = b"ok\n";
const REPLY_KO: &[u8] = b"ko\n";

// ============================================================================
// Actions
// ============================================================================

/// A registered action the coordinator may run under the lock
pub type LockAction =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

// ============================================================================
// Coordinator
// ============================================================================

/// Serves the shared reconciliation lock on a Unix socket
pub struct LockCoordinator {
    lock: Arc<Mutex<()>>,
    socket_path: PathBuf,
    action_timeout: Duration,
    actions: HashMap<String, LockAction>,
}

impl LockCoordinator {
    pub fn new(lock: Arc<Mutex<()>>, socket_path: impl Into<PathBuf>, action_timeout: Duration) -> Self {
        Self {
            lock,
            socket_path: socket_path.into(),
            action_timeout,
            actions: HashMap::new(),
        }
    }

    /// Register an action under `name`. Unregistered names get `ko`.
    pub fn register_action(&mut self, name: impl Into<String>, action: LockAction) {
        self.actions.insert(name.into(), action);
    }

    /// Bind the socket and serve requests until the task is dropped.
    /// Removes any stale socket file first.
    pub async fn serve(self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| Error::io("remove stale lock socket", e))?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("create socket dir", e))?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| Error::LockProtocol {
            reason: format!("cannot bind {}: {e}", self.socket_path.display()),
        })?;
        info!(socket = %self.socket_path.display(), "lock coordinator listening");

        let shared = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let coordinator = Arc::clone(&shared);
                    tokio::spawn(async move {
                        if let Err(e) = coordinator.handle_connection(stream).await {
                            warn!(error = %e, "lock connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "lock socket accept failed");
                }
            }
        }
    }

    /// One connection, one request/reply exchange per line. The client's
    /// lock is tied to the connection: dropping it releases the guard.
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut held: Option<OwnedMutexGuard<()>> = None;

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| Error::io("read lock request", e))?
        {
            let reply = match LockRequest::parse(&line) {
                Some(LockRequest::Lock) => {
                    if held.is_none() {
                        held = Some(Arc::clone(&self.lock).lock_owned().await);
                    }
                    debug!("lock granted");
                    REPLY_OK
                }
                Some(LockRequest::Unlock) => {
                    if held.take().is_some() {
                        debug!("lock released");
                        REPLY_OK
                    } else {
                        REPLY_KO
                    }
                }
                Some(LockRequest::Action(name)) => self.run_action(&name, &held).await,
                None => REPLY_KO,
            };
            writer
                .write_all(reply)
                .await
                .map_err(|e| Error::io("write lock reply", e))?;
        }
        Ok(())
    }

    /// Run a registered action while holding the lock. A guard the
    /// connection already holds is reused; otherwise one is acquired
    /// here and released on every exit path. Acquiring unconditionally
    /// would deadlock a connection that sent `lock` before `run`.
    async fn run_action(&self, name: &str, held: &Option<OwnedMutexGuard<()>>) -> &'static [u8] {
        let Some(action) = self.actions.get(name) else {
            warn!(action = name, "unknown lock action");
            return REPLY_KO;
        };

        let _guard = if held.is_some() {
            None
        } else {
            Some(self.lock.lock().await)
        };
        match tokio::time::timeout(self.action_timeout, action()).await {
            Ok(Ok(())) => {
                debug!(action = name, "lock action completed");
                REPLY_OK
            }
            Ok(Err(e)) => {
                warn!(action = name, error = %e, "lock action failed");
                REPLY_KO
            }
            Err(_) => {
                warn!(action = name, timeout = ?self.action_timeout, "lock action timed out");
                REPLY_KO
            }
        }
    }
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(socket = %path.display(), error = %e, "cannot remove lock socket");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_keywords() {
        assert_eq!(LockRequest::parse("lock"), Some(LockRequest::Lock));
        assert_eq!(LockRequest::parse("unlock"), Some(LockRequest::Unlock));
        assert_eq!(
            LockRequest::parse("run reload"),
            Some(LockRequest::Action("reload".to_string()))
        );
        assert_eq!(LockRequest::parse("  lock  "), Some(LockRequest::Lock));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(LockRequest::parse(""), None);
        assert_eq!(LockRequest::parse("LOCK"), None);
        assert_eq!(LockRequest::parse("run "), None);
        assert_eq!(LockRequest::parse("acquire"), None);
    }

    async fn connect_and_serve(
        coordinator: LockCoordinator,
    ) -> (tokio::net::unix::OwnedWriteHalf, tokio::net::unix::OwnedReadHalf) {
        let (client, server) = UnixStream::pair().expect("socket pair");
        let shared = Arc::new(coordinator);
        tokio::spawn(async move {
            let _ = shared.handle_connection(server).await;
        });
        let (read, write) = client.into_split();
        (write, read)
    }

    async fn exchange(
        writer: &mut tokio::net::unix::OwnedWriteHalf,
        reader: &mut tokio::net::unix::OwnedReadHalf,
        line: &str,
    ) -> String {
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).trim().to_string()
    }

    fn coordinator_for_test() -> (Arc<Mutex<()>>, LockCoordinator) {
        let lock = Arc::new(Mutex::new(()));
        let coordinator = LockCoordinator::new(
            Arc::clone(&lock),
            "/tmp/unused.sock",
            Duration::from_millis(200),
        );
        (lock, coordinator)
    }

    #[tokio::test]
    async fn test_lock_unlock_cycle() {
        let (_, coordinator) = coordinator_for_test();
        let (mut w, mut r) = connect_and_serve(coordinator).await;

        assert_eq!(exchange(&mut w, &mut r, "lock").await, "ok");
        assert_eq!(exchange(&mut w, &mut r, "unlock").await, "ok");
        // unlock without holding
        assert_eq!(exchange(&mut w, &mut r, "unlock").await, "ko");
    }

    #[tokio::test]
    async fn test_unknown_request_is_ko() {
        let (_, coordinator) = coordinator_for_test();
        let (mut w, mut r) = connect_and_serve(coordinator).await;

        assert_eq!(exchange(&mut w, &mut r, "bogus").await, "ko");
        // protocol still usable afterwards
        assert_eq!(exchange(&mut w, &mut r, "lock").await, "ok");
    }

    #[tokio::test]
    async fn test_registered_action_runs_under_lock() {
        let (lock, mut coordinator) = coordinator_for_test();
        let counter = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&counter);
        coordinator.register_action(
            "touch",
            Arc::new(move || {
                let counted = Arc::clone(&counted);
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        let (mut w, mut r) = connect_and_serve(coordinator).await;

        assert_eq!(exchange(&mut w, &mut r, "run touch").await, "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // lock must be free again
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_failed_action_still_releases_lock() {
        let (lock, mut coordinator) = coordinator_for_test();
        coordinator.register_action(
            "boom",
            Arc::new(|| {
                Box::pin(async {
                    Err(Error::JobFailed {
                        job: "boom".to_string(),
                        reason: "intentional".to_string(),
                    })
                })
            }),
        );
        let (mut w, mut r) = connect_and_serve(coordinator).await;

        assert_eq!(exchange(&mut w, &mut r, "run boom").await, "ko");
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_action_timeout_is_ko_and_releases() {
        let (lock, mut coordinator) = coordinator_for_test();
        coordinator.register_action(
            "slow",
            Arc::new(|| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                })
            }),
        );
        let (mut w, mut r) = connect_and_serve(coordinator).await;

        assert_eq!(exchange(&mut w, &mut r, "run slow").await, "ko");
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_action_while_connection_holds_lock() {
        let (lock, mut coordinator) = coordinator_for_test();
        let counter = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&counter);
        coordinator.register_action(
            "touch",
            Arc::new(move || {
                let counted = Arc::clone(&counted);
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        let (mut w, mut r) = connect_and_serve(coordinator).await;

        // lock then run on the same connection: the action reuses the
        // connection's guard instead of waiting on it forever
        assert_eq!(exchange(&mut w, &mut r, "lock").await, "ok");
        let reply = tokio::time::timeout(
            Duration::from_secs(2),
            exchange(&mut w, &mut r, "run touch"),
        )
        .await
        .expect("coordinator replied");
        assert_eq!(reply, "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // the connection still holds the lock after the action
        assert!(lock.try_lock().is_err());
        assert_eq!(exchange(&mut w, &mut r, "unlock").await, "ok");
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_unregistered_action_is_ko() {
        let (_, coordinator) = coordinator_for_test();
        let (mut w, mut r) = connect_and_serve(coordinator).await;
        assert_eq!(exchange(&mut w, &mut r, "run nothing").await, "ko");
    }
}
