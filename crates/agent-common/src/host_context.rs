// The central application context: service container, directory resolution,
// trace creation and shutdown coordination.

use crate::constants::{self, WellKnownDirectory};
use crate::secret_masker::SecretMasker;
use crate::tracing::{TraceManager, Tracing};

use agent_sdk::TraceWriter;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Why the agent is going down. Decides which shutdown message the worker
/// receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    UserCancelled,
    OperatingSystemShutdown,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::UserCancelled => write!(f, "UserCancelled"),
            ShutdownReason::OperatingSystemShutdown => write!(f, "OperatingSystemShutdown"),
        }
    }
}

/// The application context shared by every service in the host process.
///
/// Holds the service container (pre-built instances keyed by type),
/// resolves well-known directories, creates per-component trace sources
/// over the shared `SecretMasker`, and coordinates graceful shutdown.
pub struct HostContext {
    /// "Agent" for the listener process, "Worker" for the worker process.
    host_type: String,

    /// Pre-built service instances, keyed by their concrete type.
    service_instances: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,

    /// Fires when agent shutdown begins.
    agent_shutdown_token: CancellationToken,

    /// Set once `shutdown_agent` is called.
    agent_shutdown_reason: Mutex<Option<ShutdownReason>>,

    /// Secret masker shared across the process.
    pub secret_masker: SecretMasker,

    trace_manager: TraceManager,

    /// Root directory override, primarily for tests.
    root_override: Mutex<Option<PathBuf>>,
}

impl HostContext {
    pub fn new(host_type: impl Into<String>) -> Arc<Self> {
        let host_type = host_type.into();
        assert!(!host_type.is_empty(), "host_type must not be empty");

        let secret_masker = SecretMasker::new();
        let trace_manager = TraceManager::new(secret_masker.clone());

        Arc::new(Self {
            host_type,
            service_instances: DashMap::new(),
            agent_shutdown_token: CancellationToken::new(),
            agent_shutdown_reason: Mutex::new(None),
            secret_masker,
            trace_manager,
            root_override: Mutex::new(None),
        })
    }

    // -----------------------------------------------------------------------
    // Service container
    // -----------------------------------------------------------------------

    /// Register a pre-built service instance.
    pub fn register_service<T: Any + Send + Sync + 'static>(&self, service: Arc<T>) {
        self.service_instances
            .insert(TypeId::of::<T>(), service as Arc<dyn Any + Send + Sync>);
    }

    /// Look up a registered service instance.
    pub fn get_service<T: Any + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.service_instances
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Return the registered instance, or register and return a `Default` one.
    pub fn get_or_create_service<T: Default + Any + Send + Sync + 'static>(
        self: &Arc<Self>,
    ) -> Arc<T> {
        if let Some(existing) = self.get_service::<T>() {
            return existing;
        }
        let service = Arc::new(T::default());
        self.register_service(service.clone());
        service
    }

    // -----------------------------------------------------------------------
    // Directory resolution
    // -----------------------------------------------------------------------

    /// Override the agent root directory (used in tests).
    pub fn set_root_override(&self, path: PathBuf) {
        *self.root_override.lock().unwrap() = Some(path);
    }

    pub fn get_directory(&self, directory: WellKnownDirectory) -> PathBuf {
        match directory {
            WellKnownDirectory::Bin => {
                if let Some(ref root) = *self.root_override.lock().unwrap() {
                    return root.join("bin");
                }
                env::current_exe()
                    .ok()
                    .and_then(|p| p.parent().map(|p| p.to_path_buf()))
                    .unwrap_or_else(|| PathBuf::from("."))
            }

            WellKnownDirectory::Root => {
                if let Some(ref root) = *self.root_override.lock().unwrap() {
                    return root.clone();
                }
                let bin = self.get_directory(WellKnownDirectory::Bin);
                bin.parent().map(|p| p.to_path_buf()).unwrap_or(bin)
            }

            WellKnownDirectory::Diag => self
                .get_directory(WellKnownDirectory::Root)
                .join(constants::path::DIAG_DIRECTORY),

            WellKnownDirectory::Work => self
                .get_directory(WellKnownDirectory::Root)
                .join(constants::path::WORK_DIRECTORY),

            WellKnownDirectory::Temp => self
                .get_directory(WellKnownDirectory::Work)
                .join(constants::path::TEMP_DIRECTORY),
        }
    }

    // -----------------------------------------------------------------------
    // Tracing
    // -----------------------------------------------------------------------

    /// Create a trace source for the given component name.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Token that fires when agent shutdown begins.
    pub fn agent_shutdown_token(&self) -> CancellationToken {
        self.agent_shutdown_token.clone()
    }

    /// Why shutdown was initiated, if it has been.
    pub fn agent_shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.agent_shutdown_reason.lock().unwrap()
    }

    /// Begin agent shutdown.
    pub fn shutdown_agent(&self, reason: ShutdownReason) {
        let trace = self.get_trace("HostContext");
        trace.info(&format!("Agent will be shutdown for {reason}"));
        *self.agent_shutdown_reason.lock().unwrap() = Some(reason);
        self.agent_shutdown_token.cancel();
    }

    // -----------------------------------------------------------------------
    // Misc
    // -----------------------------------------------------------------------

    pub fn host_type(&self) -> &str {
        &self.host_type
    }

    /// Sleep that returns early when `cancellation_token` fires.
    pub async fn delay(
        &self,
        duration: std::time::Duration,
        cancellation_token: CancellationToken,
    ) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancellation_token.cancelled() => {}
        }
    }
}
