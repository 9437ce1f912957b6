use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::{info, warn};

use crate::application::{Application, SessionNotifier};
use crate::config::{AcceptorConfig, RetryPolicy, SessionSettings};
use crate::connection::EndpointContext;
use crate::error::{AcceptorError, Result};
use crate::listener::ListenerController;
use crate::registry::{SessionRegistry, SharedSessionRegistry};
use crate::session::SessionId;

/// Multi-session FIX acceptor.
///
/// Owns one [`ListenerController`] per configured accept endpoint, the
/// session registry they share and the application's logged-on view. An
/// acceptor can be started and stopped any number of times until it is
/// disposed.
///
/// ```no_run
/// use std::sync::Arc;
/// use fixg_acceptor::{Acceptor, NullApplication, SessionSettings};
///
/// # async fn run(settings: SessionSettings) -> fixg_acceptor::Result<()> {
/// let acceptor = Acceptor::new(Arc::new(NullApplication), &settings).await?;
/// acceptor.start().await?;
/// acceptor.stop(false).await?;
/// acceptor.start().await?;
/// acceptor.dispose().await?;
/// # Ok(())
/// # }
/// ```
pub struct Acceptor {
    config: AcceptorConfig,
    controllers: Vec<ListenerController>,
    registry: SharedSessionRegistry,
    notifier: Arc<SessionNotifier>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl Acceptor {
    /// Validates `settings` and calls `on_create` for every acceptor session.
    pub async fn new(application: Arc<dyn Application>, settings: &SessionSettings) -> Result<Self> {
        let config = AcceptorConfig::from_settings(settings)?;
        Self::with_config(application, config).await
    }

    pub async fn with_config(application: Arc<dyn Application>, config: AcceptorConfig) -> Result<Self> {
        let registry = SessionRegistry::new();
        let notifier = Arc::new(SessionNotifier::new(application));
        let next_connection_id = Arc::new(AtomicU64::new(0));

        let controllers = config
            .endpoints
            .iter()
            .map(|endpoint| {
                let ctx = Arc::new(EndpointContext {
                    config: endpoint.clone(),
                    registry: registry.clone(),
                    notifier: notifier.clone(),
                });
                ListenerController::new(ctx, next_connection_id.clone())
            })
            .collect();

        for id in config.session_ids() {
            notifier.created(id).await;
        }

        Ok(Self {
            config,
            controllers,
            registry,
            notifier,
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Binds every endpoint.
    ///
    /// If one endpoint fails the ones already bound are stopped again and the
    /// error is returned.
    pub async fn start(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AcceptorError::Disposed);
        }
        if self.started.load(Ordering::SeqCst) {
            return Err(AcceptorError::AlreadyStarted(self.endpoints()));
        }
        for (index, controller) in self.controllers.iter().enumerate() {
            if let Err(e) = controller.start().await {
                warn!(endpoint = %controller.endpoint(), error = %e, "failed to start listener");
                for started in &self.controllers[..index] {
                    if let Err(stop_err) = started.stop(true).await {
                        warn!(endpoint = %started.endpoint(), error = %stop_err, "rollback stop failed");
                    }
                }
                return Err(e);
            }
        }
        self.started.store(true, Ordering::SeqCst);
        info!(endpoints = %self.endpoints(), "acceptor started");
        Ok(())
    }

    /// [`Acceptor::start`], retrying bind failures with backoff.
    pub async fn start_with_retry(&self, policy: RetryPolicy) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.start().await {
                Err(e) if e.is_retryable() && attempt + 1 < policy.attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %e, "start failed, retrying");
                    time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Stops every listener; see [`ListenerController::stop`].
    ///
    /// All listeners are stopped even if one fails; the first error is
    /// returned.
    pub async fn stop(&self, force: bool) -> Result<()> {
        let mut first_err = None;
        for controller in &self.controllers {
            if let Err(e) = controller.stop(force).await {
                warn!(endpoint = %controller.endpoint(), error = %e, "failed to stop listener");
                first_err.get_or_insert(e);
            }
        }
        if self.started.swap(false, Ordering::SeqCst) {
            info!(force, "acceptor stopped");
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Force-stops and releases every listener. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_err = None;
        for controller in &self.controllers {
            if let Err(e) = controller.dispose().await {
                first_err.get_or_insert(e);
            }
        }
        self.started.store(false, Ordering::SeqCst);
        info!("acceptor disposed");
        first_err.map_or(Ok(()), Err)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// True if any listener is bound and accepting.
    pub fn are_sockets_running(&self) -> bool {
        self.controllers.iter().any(ListenerController::is_running)
    }

    /// True if any session is logged on.
    pub fn is_logged_on(&self) -> bool {
        self.notifier.is_logged_on()
    }

    pub fn logged_on_sessions(&self) -> Vec<SessionId> {
        self.notifier.logged_on()
    }

    pub async fn wait_for_logon(&self, id: &SessionId, timeout: Duration) -> bool {
        self.notifier.wait_for(id, true, timeout).await
    }

    pub async fn wait_for_logout(&self, id: &SessionId, timeout: Duration) -> bool {
        self.notifier.wait_for(id, false, timeout).await
    }

    pub fn registry(&self) -> &SharedSessionRegistry {
        &self.registry
    }

    /// Severs the connection that holds `id`. Returns false if none does.
    pub fn disconnect(&self, id: &SessionId) -> bool {
        match self.registry.get(id) {
            Some(handle) => {
                info!(session = %id, connection = %handle.id(), "disconnect requested");
                handle.request_close()
            }
            None => false,
        }
    }

    /// Bound addresses of the running listeners.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.controllers.iter().filter_map(ListenerController::local_addr).collect()
    }

    /// Every configured acceptor session.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.config.session_ids().cloned().collect()
    }

    pub fn config(&self) -> &AcceptorConfig {
        &self.config
    }

    pub fn listeners(&self) -> &[ListenerController] {
        &self.controllers
    }

    fn endpoints(&self) -> String {
        self.config
            .endpoints
            .iter()
            .map(|e| e.address())
            .collect::<Vec<_>>()
            .join(",")
    }
}
