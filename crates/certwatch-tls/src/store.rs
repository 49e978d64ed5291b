//! The hot-reloading credential store.
//!
//! A store is bound to three PEM files. It loads them once at construction
//! (failing hard on bad input), then re-reads them on every reconcile tick.
//! Readers get the last material that parsed and matched; a failed tick never
//! replaces good material with bad.

use std::sync::Arc;
use std::time::Duration;

use certwatch_core::{CredentialMode, StoreSettings};
use parking_lot::Mutex;
use rustls::ClientConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::sign::CertifiedKey;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CredentialError, StoreError};
use crate::fingerprint::Fingerprint;
use crate::material::{CredentialMaterial, default_provider, parse_certified_key, parse_roots};
use crate::resolver::ClientCertResolver;
use crate::snapshot::{ServerSnapshot, TlsOptions, build_client_config};
use crate::source::{CredentialPaths, CredentialSource};

/// Default period between reconcile ticks.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Everything needed to open a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub paths: CredentialPaths,
    pub mode: CredentialMode,
    pub reconcile_interval: Duration,
    pub options: TlsOptions,
}

impl StoreConfig {
    pub fn new(paths: CredentialPaths, mode: CredentialMode) -> Self {
        Self {
            paths,
            mode,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            options: TlsOptions::default(),
        }
    }

    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: TlsOptions) -> Self {
        self.options = options;
        self
    }

    /// Build a store config from the `store` section of the settings file.
    pub fn from_settings(settings: &StoreSettings) -> Result<Self, StoreError> {
        let missing = |what: &str| StoreError::InvalidSettings(format!("{what} is not configured"));

        let key = settings.key_path.clone().ok_or_else(|| missing("key_path"))?;
        let cert = settings.cert_path.clone().ok_or_else(|| missing("cert_path"))?;
        let ca = settings.ca_path.clone().ok_or_else(|| missing("ca_path"))?;

        if settings.reconcile_interval_secs == 0 {
            return Err(StoreError::InvalidSettings(
                "reconcile_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            paths: CredentialPaths::new(key, cert, ca),
            mode: settings.mode,
            reconcile_interval: settings.reconcile_interval(),
            options: TlsOptions {
                min_version: settings.min_tls_version,
                server_name: settings.server_name.clone(),
                alpn_protocols: Vec::new(),
                require_client_auth: settings.require_client_auth,
            },
        })
    }
}

/// What happened to the CA bundle during a reconcile tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaUpdate {
    Unchanged,
    /// Server mode: the verifier roots were rebuilt.
    Rotated,
    /// Client mode: new CA content was seen and deliberately not applied.
    Ignored,
}

/// Result of a successful reconcile tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub keypair_rotated: bool,
    pub ca: CaUpdate,
}

impl ReconcileOutcome {
    const UNCHANGED: Self = Self {
        keypair_rotated: false,
        ca: CaUpdate::Unchanged,
    };

    /// Whether the material readers see has changed.
    pub fn changed(&self) -> bool {
        self.keypair_rotated || self.ca == CaUpdate::Rotated
    }
}

struct StoreState {
    material: Arc<CredentialMaterial>,
    /// Set when `material` moved on since `snapshot` was built.
    stale: bool,
    snapshot: Option<Arc<ServerSnapshot>>,
    generation: u64,
    last_error: Option<String>,
    /// CA content already warned about in client mode.
    ignored_ca: Option<Fingerprint>,
}

/// State shared between the store handle, its background task and the
/// client certificate resolver.
pub(crate) struct StoreInner {
    pub(crate) source: CredentialSource,
    mode: CredentialMode,
    options: TlsOptions,
    provider: Arc<CryptoProvider>,
    state: Mutex<StoreState>,
    /// Serialises whole ticks so a slow reader cannot commit older bytes
    /// over a newer tick's result.
    reconcile_lock: Mutex<()>,
}

impl StoreInner {
    pub(crate) fn client_certificate(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.state.lock().material.certified_key)
    }

    fn record_failure(&self, err: CredentialError) -> StoreError {
        error!(
            cert = %self.source.paths().cert.display(),
            error = %err,
            "Credential reconcile failed, keeping last good material"
        );
        self.state.lock().last_error = Some(err.to_string());
        StoreError::TransientRead(err)
    }

    fn reconcile(&self) -> Result<ReconcileOutcome, StoreError> {
        let _tick = self.reconcile_lock.lock();
        let paths = self.source.paths();

        let ca_pem = self
            .source
            .read_ca()
            .map_err(|e| self.record_failure(e))?;
        let raw = self
            .source
            .read_keypair()
            .map_err(|e| self.record_failure(e))?;

        let current = Arc::clone(&self.state.lock().material);
        let ca_changed = current.ca_pem != ca_pem;
        let keypair_changed = current.keypair_differs(&raw);

        if !ca_changed && !keypair_changed {
            let mut state = self.state.lock();
            state.last_error = None;
            state.ignored_ca = None;
            debug!(cert = %paths.cert.display(), "Credentials unchanged");
            return Ok(ReconcileOutcome::UNCHANGED);
        }

        // Parse everything before touching shared state.
        let ca = match (ca_changed, self.mode) {
            (false, _) => CaUpdate::Unchanged,
            (true, CredentialMode::Client) => CaUpdate::Ignored,
            (true, CredentialMode::Server) => CaUpdate::Rotated,
        };
        let roots = if ca == CaUpdate::Rotated {
            parse_roots(&ca_pem, &paths.ca).map_err(|e| self.record_failure(e))?
        } else {
            Arc::clone(&current.roots)
        };
        let certified_key = if keypair_changed {
            parse_certified_key(&self.provider, &raw, &paths.cert, &paths.key)
                .map_err(|e| self.record_failure(e))?
        } else {
            Arc::clone(&current.certified_key)
        };

        let outcome = ReconcileOutcome {
            keypair_rotated: keypair_changed,
            ca,
        };

        let mut state = self.state.lock();
        state.last_error = None;

        if ca == CaUpdate::Ignored {
            let fingerprint = Fingerprint::of(&ca_pem);
            if state.ignored_ca != Some(fingerprint) {
                warn!(
                    ca = %paths.ca.display(),
                    fingerprint = %fingerprint,
                    "CA bundle changed on disk; client trust anchors are not rotated in place"
                );
                state.ignored_ca = Some(fingerprint);
            }
        } else {
            state.ignored_ca = None;
        }

        if outcome.changed() {
            let (ca_pem, ca_state) = if ca == CaUpdate::Rotated {
                (ca_pem, "rotated")
            } else {
                (current.ca_pem.clone(), "unchanged")
            };
            state.material = Arc::new(CredentialMaterial {
                certified_key,
                cert_pem: raw.cert_pem,
                key_pem: raw.key_pem,
                roots,
                ca_pem,
            });
            state.stale = true;
            info!(
                cert = %paths.cert.display(),
                keypair_rotated = keypair_changed,
                ca = ca_state,
                "Credentials reloaded"
            );
        }

        Ok(outcome)
    }

    fn server_config(&self) -> Result<Arc<ServerSnapshot>, StoreError> {
        let mut state = self.state.lock();
        if let Some(snapshot) = state.snapshot.as_ref().filter(|_| !state.stale) {
            return Ok(Arc::clone(snapshot));
        }

        let generation = state.generation + 1;
        match ServerSnapshot::build(&self.provider, &state.material, &self.options, generation) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                state.snapshot = Some(Arc::clone(&snapshot));
                state.generation = generation;
                state.stale = false;
                debug!(generation, "Server config rebuilt");
                Ok(snapshot)
            }
            Err(err) => {
                error!(error = %err, "Failed to rebuild server config");
                let message = err.to_string();
                state.stale = false;
                state.last_error = Some(message);
                // Keep serving the previous snapshot if there is one.
                state
                    .snapshot
                    .as_ref()
                    .map(Arc::clone)
                    .ok_or(StoreError::Snapshot(err))
            }
        }
    }
}

/// Owns the current credential material and the task that refreshes it.
pub struct CredentialStore {
    inner: Arc<StoreInner>,
    client_config: Mutex<Option<Arc<ClientConfig>>>,
    interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("paths", self.inner.source.paths())
            .field("mode", &self.inner.mode)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Load the credentials synchronously without starting the background task.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let StoreConfig {
            paths,
            mode,
            reconcile_interval,
            options,
        } = config;

        if reconcile_interval.is_zero() {
            return Err(StoreError::InvalidSettings(
                "reconcile interval must be greater than zero".to_string(),
            ));
        }
        options
            .server_name()
            .map_err(StoreError::Configuration)?;

        let provider = default_provider();
        let source = CredentialSource::new(paths);
        let material =
            CredentialMaterial::load(&source, &provider).map_err(StoreError::Configuration)?;

        let inner = Arc::new(StoreInner {
            source,
            mode,
            options,
            provider,
            state: Mutex::new(StoreState {
                material: Arc::new(material),
                stale: true,
                snapshot: None,
                generation: 0,
                last_error: None,
                ignored_ca: None,
            }),
            reconcile_lock: Mutex::new(()),
        });

        if mode == CredentialMode::Server {
            inner.server_config()?;
        }

        info!(
            cert = %inner.source.paths().cert.display(),
            mode = ?mode,
            "Credential store opened"
        );

        Ok(Self {
            inner,
            client_config: Mutex::new(None),
            interval: reconcile_interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Load the credentials and start reconciling them in the background.
    ///
    /// Must be called from within a tokio runtime. No task is spawned if
    /// loading fails.
    pub fn start(config: StoreConfig) -> Result<Self, StoreError> {
        let store = Self::open(config)?;
        let handle = spawn_reconcile_loop(
            Arc::clone(&store.inner),
            store.interval,
            store.cancel.clone(),
        );
        *store.task.lock() = Some(handle);
        Ok(store)
    }

    /// Run one reconcile tick now.
    pub fn reconcile(&self) -> Result<ReconcileOutcome, StoreError> {
        self.inner.reconcile()
    }

    /// The current client certificate and key. Never performs I/O.
    pub fn client_certificate(&self) -> Arc<CertifiedKey> {
        self.inner.client_certificate()
    }

    /// A client config trusting the CA roots current when it was first
    /// requested, presenting whatever certificate the store holds at
    /// handshake time.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, StoreError> {
        let mut slot = self.client_config.lock();
        if let Some(config) = slot.as_ref() {
            return Ok(Arc::clone(config));
        }

        let roots = Arc::clone(&self.inner.state.lock().material.roots);
        let resolver = Arc::new(ClientCertResolver::new(Arc::clone(&self.inner)));
        let config = build_client_config(&self.inner.provider, roots, resolver, &self.inner.options)
            .map_err(StoreError::Configuration)?;
        let config = Arc::new(config);
        *slot = Some(Arc::clone(&config));
        Ok(config)
    }

    /// The server name clients built from this store verify against.
    pub fn server_name(&self) -> Option<ServerName<'static>> {
        self.inner.options.server_name().ok().flatten()
    }

    /// The current server config snapshot, rebuilt once after each change.
    pub fn server_config(&self) -> Result<Arc<ServerSnapshot>, StoreError> {
        self.inner.server_config()
    }

    /// The error from the most recent tick, if it failed.
    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }

    pub fn mode(&self) -> CredentialMode {
        self.inner.mode
    }

    pub fn paths(&self) -> &CredentialPaths {
        self.inner.source.paths()
    }

    /// Whether the background task is still running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the background task. A tick already in progress completes.
    /// Calling this more than once is a no-op.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!(cert = %self.inner.source.paths().cert.display(), "Closing credential store");
        }
        self.cancel.cancel();
    }

    /// Close and wait for the background task to exit.
    pub async fn shutdown(&self) {
        self.close();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Credential reconcile task ended abnormally");
            }
        }
    }
}

impl Drop for CredentialStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_reconcile_loop(
    inner: Arc<StoreInner>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            cert = %inner.source.paths().cert.display(),
            interval_secs = period.as_secs(),
            "Credential reconcile loop started"
        );

        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; material was just loaded.
        timer.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Credential reconcile loop stopped");
                    return;
                }
                _ = timer.tick() => {}
            }
            // Errors are logged and recorded by reconcile itself.
            let _ = inner.reconcile();
        }
    })
}
