use actix_web::body::MessageBody;
use actix_web::dev::{Server, ServerHandle, ServiceFactory, ServiceRequest, ServiceResponse};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::middleware::{from_fn, Condition, DefaultHeaders, Logger};
use actix_web::{web, App, Error, HttpServer};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ensure_regular_file, AuthConfig, ServerConfig, TlsConfig};
use crate::errors::{ConfigError, ServerError};
use crate::middleware::{basic_auth, catch_panic};
use crate::routes;
use crate::service::PrintService;

// Seconds a graceful stop waits for in-flight requests.
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

// ============================================================================
// App factory
// ============================================================================

/// Per-instance snapshot of everything the app factory reads from the config.
#[derive(Debug, Clone)]
pub struct AppSettings {
    headers: Vec<(HeaderName, HeaderValue)>,
    auth: AuthConfig,
}

impl AppSettings {
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            headers: config.header_pairs()?,
            auth: config.auth.clone(),
        })
    }
}

/// Builds the router wrapped, outermost first, in access logging, header
/// injection, panic recovery and (when enabled) Basic auth.
pub fn build_app(
    service: web::Data<PrintService>,
    settings: &AppSettings,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = Error,
        InitError = (),
    >,
> {
    let headers = settings
        .headers
        .iter()
        .cloned()
        .fold(DefaultHeaders::new(), |headers, pair| headers.add(pair));

    App::new()
        .app_data(service)
        .app_data(web::Data::new(settings.auth.clone()))
        .configure(routes::configure)
        .default_service(web::to(routes::not_found))
        .wrap(Condition::new(settings.auth.enabled, from_fn(basic_auth)))
        .wrap(from_fn(catch_panic))
        .wrap(headers)
        .wrap(Logger::default().log_target("http"))
}

/// Loads the PEM certificate chain and private key named by `tls`.
pub fn load_tls_config(tls: &TlsConfig) -> Result<rustls::ServerConfig, ServerError> {
    let tls_error = |path: &Path, e: &dyn std::fmt::Display| {
        ServerError::Tls(format!("{}: {}", path.display(), e))
    };

    let cert_file = tls.cert_file.as_path();
    let key_file = tls.key_file.as_path();
    ensure_regular_file(cert_file).map_err(|e| tls_error(cert_file, &e))?;
    ensure_regular_file(key_file).map_err(|e| tls_error(key_file, &e))?;

    let certs = CertificateDer::pem_file_iter(cert_file)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(|e| tls_error(cert_file, &e))?;
    if certs.is_empty() {
        return Err(tls_error(cert_file, &"no certificates found"));
    }
    let key = PrivateKeyDer::from_pem_file(key_file).map_err(|e| tls_error(key_file, &e))?;

    rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running { addr: SocketAddr, tls: bool },
    Stopping,
    Failed(String),
}

/// Read-only view of the listener, as shown to status observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub running: bool,
    pub error: String,
    pub running_host: String,
    pub running_port: u16,
}

impl From<&ServerState> for ServerStatus {
    fn from(state: &ServerState) -> Self {
        match state {
            ServerState::Running { addr, .. } => ServerStatus {
                running: true,
                running_host: addr.ip().to_string(),
                running_port: addr.port(),
                ..Default::default()
            },
            ServerState::Failed(error) => ServerStatus {
                error: error.clone(),
                ..Default::default()
            },
            _ => ServerStatus::default(),
        }
    }
}

struct Instance {
    id: u64,
    handle: ServerHandle,
    task: JoinHandle<()>,
}

/// Owns the single live listener and publishes its state.
pub struct ServerManager {
    service: web::Data<PrintService>,
    instance: Mutex<Option<Instance>>,
    // Id of the instance whose exit should be reported; 0 when none.
    current: Arc<AtomicU64>,
    next_id: AtomicU64,
    state: Arc<watch::Sender<ServerState>>,
}

impl ServerManager {
    pub fn new(service: PrintService) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        Self {
            service: web::Data::new(service),
            instance: Mutex::new(None),
            current: Arc::new(AtomicU64::new(0)),
            next_id: AtomicU64::new(1),
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ServerState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus::from(&*self.state.borrow())
    }

    /// Starts a listener for `config`, abruptly closing any running one first.
    pub async fn start(&self, config: &ServerConfig) -> Result<SocketAddr, ServerError> {
        let mut slot = self.instance.lock().await;
        if let Some(old) = slot.take() {
            info!("Replacing running server");
            self.stop_instance(old, false).await;
        }

        self.set_state(ServerState::Starting);
        match self.spawn(config) {
            Ok((instance, addr)) => {
                info!("Server listening on {}://{}", config.scheme(), addr);
                self.set_state(ServerState::Running {
                    addr,
                    tls: config.tls.enabled,
                });
                *slot = Some(instance);
                Ok(addr)
            }
            Err(e) => {
                error!("Server failed to start: {}", e);
                self.set_state(ServerState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Abruptly closes the listener. Does nothing when already stopped.
    pub async fn stop(&self) {
        let mut slot = self.instance.lock().await;
        if let Some(instance) = slot.take() {
            self.stop_instance(instance, false).await;
        }
    }

    /// Graceful stop for process exit, falling back to an abrupt stop after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let mut slot = self.instance.lock().await;
        let Some(instance) = slot.take() else {
            return;
        };

        self.release(&instance);
        info!("Shutting down server (grace {:?})", grace);
        if tokio::time::timeout(grace, instance.handle.stop(true))
            .await
            .is_err()
        {
            warn!("Graceful shutdown timed out, closing connections");
            instance.handle.stop(false).await;
        }
        self.finish(instance).await;
    }

    fn spawn(&self, config: &ServerConfig) -> Result<(Instance, SocketAddr), ServerError> {
        let settings = AppSettings::from_config(config)?;
        let service = self.service.clone();

        let server = HttpServer::new(move || build_app(service.clone(), &settings))
            .disable_signals()
            .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS);

        let addr = config.socket_addr();
        let bound = if config.tls.enabled {
            let tls = load_tls_config(&config.tls)?;
            server.bind_rustls_0_23(addr, tls)
        } else {
            server.bind(addr)
        }
        .map_err(|source| ServerError::Bind { addr, source })?;

        let local_addr = bound.addrs().first().copied().unwrap_or(addr);
        let server = bound.run();
        let handle = server.handle();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.current.store(id, Ordering::SeqCst);
        let task = tokio::spawn(supervise(id, server, self.current.clone(), self.state.clone()));

        Ok((Instance { id, handle, task }, local_addr))
    }

    async fn stop_instance(&self, instance: Instance, graceful: bool) {
        self.release(&instance);
        instance.handle.stop(graceful).await;
        self.finish(instance).await;
    }

    // From here on the manager, not the supervisor, reports this instance's exit.
    fn release(&self, instance: &Instance) {
        let _ = self
            .current
            .compare_exchange(instance.id, 0, Ordering::SeqCst, Ordering::SeqCst);
        self.set_state(ServerState::Stopping);
    }

    async fn finish(&self, instance: Instance) {
        if let Err(e) = instance.task.await {
            warn!("Server task ended abnormally: {}", e);
        }
        info!("Server stopped");
        self.set_state(ServerState::Stopped);
    }

    fn set_state(&self, state: ServerState) {
        self.state.send_replace(state);
    }
}

async fn supervise(
    id: u64,
    server: Server,
    current: Arc<AtomicU64>,
    state: Arc<watch::Sender<ServerState>>,
) {
    let result = server.await;
    if current
        .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    match result {
        Ok(()) => {
            info!("Server exited");
            state.send_replace(ServerState::Stopped);
        }
        Err(e) => {
            error!("Server exited with error: {}", e);
            state.send_replace(ServerState::Failed(e.to_string()));
        }
    }
}
