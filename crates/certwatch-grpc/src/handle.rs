//! An outbound connection that is rebuilt when its credential files change.
//!
//! The active connection sits behind an `ArcSwap`, so readers never block.
//! A check compares content fingerprints of the files the connection was
//! built from; on a difference it builds a replacement through the factory,
//! swaps it in, and hands the old one to a retirement task that closes it
//! after a grace delay.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use certwatch_tls::FingerprintPair;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HandleConfig;
use crate::error::ClientError;
use crate::factory::{Connection, ConnectionFactory};

/// Result of one credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationResult {
    /// Credential files are unchanged.
    NotNeeded,
    /// A new connection was swapped in.
    Rotated {
        /// Version of the connection now active.
        version: u64,
    },
    /// The files changed but no replacement could be built; the old
    /// connection stays active.
    Failed(String),
}

struct Active<C> {
    connection: Arc<C>,
    version: u64,
}

type Retired<C> = (Instant, Arc<C>);

/// Owns the active outbound connection for one endpoint.
pub struct RotatingConnectionHandle<F: ConnectionFactory> {
    factory: F,
    active: ArcSwap<Active<F::Connection>>,
    /// Fingerprints the active connection was built from. Held for a whole
    /// check so checks never overlap.
    fingerprints: tokio::sync::Mutex<FingerprintPair>,
    config: HandleConfig,
    retire_tx: mpsc::UnboundedSender<Retired<F::Connection>>,
    cancel: CancellationToken,
    retirement: parking_lot::Mutex<Option<JoinHandle<()>>>,
    reload: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> std::fmt::Debug for RotatingConnectionHandle<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingConnectionHandle")
            .field("version", &self.version())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> RotatingConnectionHandle<F> {
    /// Fingerprint the credential files and build the first connection.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(factory: F, config: HandleConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let files = factory.watched_files();
        let fingerprints = FingerprintPair::read(files.client_cert, files.server_ca)?;
        let connection = factory.connect().await?;

        let cancel = CancellationToken::new();
        let (retire_tx, retire_rx) = mpsc::unbounded_channel();
        let retirement = tokio::spawn(run_retirement(retire_rx, cancel.clone()));

        debug!(
            client_cert = ?fingerprints.client_cert,
            server_ca = ?fingerprints.server_ca,
            "Initial credential fingerprints"
        );

        Ok(Self {
            factory,
            active: ArcSwap::from_pointee(Active {
                connection: Arc::new(connection),
                version: 0,
            }),
            fingerprints: tokio::sync::Mutex::new(fingerprints),
            config,
            retire_tx,
            cancel,
            retirement: parking_lot::Mutex::new(Some(retirement)),
            reload: parking_lot::Mutex::new(None),
        })
    }

    /// The connection to use for new calls.
    pub fn connection(&self) -> Arc<F::Connection> {
        Arc::clone(&self.active.load().connection)
    }

    /// Number of rotations since the handle was created.
    pub fn version(&self) -> u64 {
        self.active.load().version
    }

    /// The connection and its version, read together.
    pub fn current(&self) -> (Arc<F::Connection>, u64) {
        let active = self.active.load();
        (Arc::clone(&active.connection), active.version)
    }

    pub const fn factory(&self) -> &F {
        &self.factory
    }

    /// Compare the credential files with what the active connection was
    /// built from and rebuild on any difference.
    pub async fn check_and_reload(&self) -> RotationResult {
        let mut built_from = self.fingerprints.lock().await;

        let files = self.factory.watched_files();
        let latest = match FingerprintPair::read(files.client_cert, files.server_ca) {
            Ok(latest) => latest,
            Err(e) => {
                error!(error = %e, "Failed to fingerprint credential files");
                return RotationResult::Failed(e.to_string());
            }
        };

        if latest == *built_from {
            debug!("Credential files unchanged");
            return RotationResult::NotNeeded;
        }

        info!(
            client_cert_changed = latest.client_cert != built_from.client_cert,
            server_ca_changed = latest.server_ca != built_from.server_ca,
            "Credential files changed, rebuilding connection"
        );

        let connection = match self.factory.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "Failed to rebuild connection, keeping the current one");
                return RotationResult::Failed(e.to_string());
            }
        };

        let version = self.active.load().version + 1;
        let previous = self.active.swap(Arc::new(Active {
            connection: Arc::new(connection),
            version,
        }));
        *built_from = latest;
        drop(built_from);

        self.retire(Arc::clone(&previous.connection));
        info!(
            version,
            grace_secs = self.config.grace_delay.as_secs(),
            "Connection rotated"
        );
        RotationResult::Rotated { version }
    }

    fn retire(&self, connection: Arc<F::Connection>) {
        let deadline = Instant::now() + self.config.grace_delay;
        if let Err(mpsc::error::SendError((_, connection))) =
            self.retire_tx.send((deadline, connection))
        {
            // Retirement task is gone; nothing would ever close it.
            connection.close();
        }
    }

    /// Run `check_and_reload` every `check_interval` until closed.
    ///
    /// The loop holds only a weak reference, so dropping the last handle
    /// also ends it.
    pub fn spawn_reload_loop(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.config.check_interval;

        let task = tokio::spawn(async move {
            info!(
                interval_secs = period.as_secs(),
                "Connection credential check loop started"
            );

            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Connection credential check loop stopped");
                        return;
                    }
                    _ = timer.tick() => {}
                }
                let Some(handle) = weak.upgrade() else {
                    return;
                };
                handle.check_and_reload().await;
            }
        });

        if let Some(previous) = self.reload.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop the check loop and the retirement task, and close every
    /// connection the handle owns. Calling this more than once is a no-op.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.active.load().connection.close();
        info!(version = self.version(), "Rotating connection handle closed");
    }

    /// Close and wait for the background tasks to exit.
    pub async fn shutdown(&self) {
        self.close();
        let tasks = [self.reload.lock().take(), self.retirement.lock().take()];
        for task in tasks.into_iter().flatten() {
            if let Err(e) = task.await {
                warn!(error = %e, "Connection handle task ended abnormally");
            }
        }
    }
}

impl<F: ConnectionFactory> Drop for RotatingConnectionHandle<F> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Close superseded connections once their grace delay has passed.
///
/// Deadlines arrive in order because every connection gets the same delay.
async fn run_retirement<C: Connection>(
    mut rx: mpsc::UnboundedReceiver<Retired<C>>,
    cancel: CancellationToken,
) {
    let mut pending: VecDeque<Retired<C>> = VecDeque::new();

    loop {
        let next = pending.front().map(|(deadline, _)| *deadline);
        tokio::select! {
            () = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(retired) => pending.push_back(retired),
                None => break,
            },
            () = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                if let Some((_, connection)) = pending.pop_front() {
                    connection.close();
                }
            }
        }
    }

    rx.close();
    while let Ok(retired) = rx.try_recv() {
        pending.push_back(retired);
    }
    if !pending.is_empty() {
        debug!(count = pending.len(), "Closing superseded connections early");
    }
    for (_, connection) in pending {
        connection.close();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::factory::WatchedFiles;

    #[derive(Debug)]
    struct FakeConnection {
        id: usize,
        closed: AtomicBool,
    }

    impl Connection for FakeConnection {
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl FakeConnection {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct FakeFactory {
        _dir: tempfile::TempDir,
        cert: PathBuf,
        ca: PathBuf,
        built: AtomicUsize,
        fail: AtomicBool,
    }

    impl FakeFactory {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cert = dir.path().join("client.pem");
            let ca = dir.path().join("ca.pem");
            std::fs::write(&cert, "cert-a").unwrap();
            std::fs::write(&ca, "ca-c").unwrap();
            Self {
                _dir: dir,
                cert,
                ca,
                built: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }

        fn builds(&self) -> usize {
            self.built.load(Ordering::SeqCst)
        }
    }

    impl ConnectionFactory for FakeFactory {
        type Connection = FakeConnection;

        async fn connect(&self) -> Result<FakeConnection, ClientError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClientError::Probe("endpoint unreachable".into()));
            }
            let id = self.built.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConnection {
                id,
                closed: AtomicBool::new(false),
            })
        }

        fn watched_files(&self) -> WatchedFiles<'_> {
            WatchedFiles {
                client_cert: Some(self.cert.as_path()),
                server_ca: Some(self.ca.as_path()),
            }
        }
    }

    async fn handle() -> Arc<RotatingConnectionHandle<FakeFactory>> {
        Arc::new(
            RotatingConnectionHandle::new(FakeFactory::new(), HandleConfig::default())
                .await
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_files_do_not_rebuild() {
        let handle = handle().await;
        let first = handle.connection();

        for _ in 0..3 {
            assert_eq!(handle.check_and_reload().await, RotationResult::NotNeeded);
        }

        assert!(Arc::ptr_eq(&first, &handle.connection()));
        assert_eq!(handle.version(), 0);
        assert_eq!(handle.factory().builds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_cert_rotates_connection() {
        let handle = handle().await;
        let first = handle.connection();

        std::fs::write(&handle.factory().cert, "cert-b").unwrap();
        assert_eq!(
            handle.check_and_reload().await,
            RotationResult::Rotated { version: 1 }
        );

        let second = handle.connection();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.id, 1);
        assert_eq!(handle.version(), 1);

        // The new fingerprints are remembered.
        assert_eq!(handle.check_and_reload().await, RotationResult::NotNeeded);

        std::fs::write(&handle.factory().ca, "ca-c2").unwrap();
        assert_eq!(
            handle.check_and_reload().await,
            RotationResult::Rotated { version: 2 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_connection_closes_after_grace_delay() {
        let handle = handle().await;
        let first = handle.connection();

        std::fs::write(&handle.factory().cert, "cert-b").unwrap();
        handle.check_and_reload().await;

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!first.is_closed(), "closed before the grace delay");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(first.is_closed(), "still open after the grace delay");
        assert!(!handle.connection().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rebuild_keeps_old_connection() {
        let handle = handle().await;
        let first = handle.connection();

        handle.factory().fail.store(true, Ordering::SeqCst);
        std::fs::write(&handle.factory().cert, "cert-b").unwrap();
        assert!(matches!(
            handle.check_and_reload().await,
            RotationResult::Failed(_)
        ));
        assert!(Arc::ptr_eq(&first, &handle.connection()));
        assert_eq!(handle.version(), 0);

        // Retried on the next check.
        handle.factory().fail.store(false, Ordering::SeqCst);
        assert_eq!(
            handle.check_and_reload().await,
            RotationResult::Rotated { version: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_file_is_reported_without_rotation() {
        let handle = handle().await;
        std::fs::remove_file(&handle.factory().ca).unwrap();

        assert!(matches!(
            handle.check_and_reload().await,
            RotationResult::Failed(_)
        ));
        assert_eq!(handle.factory().builds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_loop_rotates_on_interval() {
        let handle = handle().await;
        handle.spawn_reload_loop();

        std::fs::write(&handle.factory().cert, "cert-b").unwrap();
        tokio::time::sleep(Duration::from_secs(15 * 60 + 1)).await;
        assert_eq!(handle.version(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_releases_pending_connections_immediately() {
        let handle = handle().await;
        let first = handle.connection();

        std::fs::write(&handle.factory().cert, "cert-b").unwrap();
        handle.check_and_reload().await;
        assert!(!first.is_closed());

        handle.close();
        handle.close();
        handle.shutdown().await;

        assert!(first.is_closed());
        assert!(handle.connection().is_closed());
    }
}
