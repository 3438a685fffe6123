//! Startup: the ordered chain that acquires every resource and binds the
//! listeners.
//!
//! ```text
//! open persistence → sync schema                       (fatal, nothing released)
//! → auth routes → manager → scheduler.attach(manager)
//! → event pump (message + error handlers) → business routes
//! → load TLS material                                  (never fatal)
//! → bind plain listener                                (fatal)
//! → bind encrypted listener, if TLS is complete        (fatal)
//! → activation hook, if the encrypted listener bound
//! ```
//!
//! A fatal error after the schema sync releases whatever was acquired through
//! the [`ShutdownSequencer`] before it is returned.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::activation::{ActivationHook, ActivationStatus};
use super::phase::{LifecyclePhase, PhaseError, PhaseTracker};
use super::resources::AcquiredResources;
use super::shutdown::{ShutdownReport, ShutdownSequencer};
use crate::auth::{self, OAuthSettings};
use crate::config::{Config, TlsPaths};
use crate::persistence::{Database, Persistence, SessionStore, SubscriptionStore};
use crate::platform::PlatformClient;
use crate::server::listener::{ListenerHandle, PlainListener, TlsListener};
use crate::server::state::AppState;
use crate::server::tls::TlsMaterial;
use crate::server::{middleware, router};
use crate::webhooks::handlers::{self, MessageLog};
use crate::webhooks::{
    ManagerAssembly, ManagerBuilder, Seeder, SubscriptionManager, TopStreamsSeeder,
};

/// Fatal startup failures, by step.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to open persistence: {0:#}")]
    PersistenceOpen(anyhow::Error),

    #[error("failed to sync persistence schema: {0:#}")]
    PersistenceSync(anyhow::Error),

    #[error("failed to register authorization routes: {0:#}")]
    AuthRoutes(anyhow::Error),

    #[error("failed to construct subscription manager: {0:#}")]
    ManagerConstruction(anyhow::Error),

    #[error("failed to register application routes: {0:#}")]
    AppRoutes(anyhow::Error),

    #[error("failed to bind plain listener: {0:#}")]
    PlainBind(anyhow::Error),

    #[error("failed to bind encrypted listener: {0:#}")]
    EncryptedBind(anyhow::Error),

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

/// What the business routes get to see.
pub struct RouteContext {
    pub manager: Arc<dyn SubscriptionManager>,
    pub messages: MessageLog,
    pub phase: watch::Receiver<LifecyclePhase>,
    pub activation: watch::Receiver<ActivationStatus>,
}

/// Factory for the collaborators startup wires together.
#[async_trait]
pub trait Subsystems: Send + Sync {
    type Db: Persistence + 'static;

    async fn open_persistence(&self) -> Result<Arc<Self::Db>>;

    fn auth_routes(&self, db: &Self::Db) -> Result<Router>;

    fn build_manager(&self, db: &Self::Db) -> Result<ManagerAssembly>;

    fn app_routes(&self, db: &Self::Db, context: RouteContext) -> Result<Router>;

    fn seeder(&self) -> Arc<dyn Seeder>;
}

/// Production collaborators: SQLite, the platform client, and the
/// top-streams seeding policy.
pub struct PlatformSubsystems {
    cfg: Config,
    platform: PlatformClient,
}

impl PlatformSubsystems {
    pub fn new(cfg: &Config) -> Result<Self> {
        Ok(Self {
            cfg: cfg.clone(),
            platform: PlatformClient::new(cfg)?,
        })
    }
}

#[async_trait]
impl Subsystems for PlatformSubsystems {
    type Db = Database;

    async fn open_persistence(&self) -> Result<Arc<Database>> {
        Ok(Arc::new(Database::open(&self.cfg.database_url).await?))
    }

    fn auth_routes(&self, db: &Database) -> Result<Router> {
        self.cfg.check_redirect_path()?;
        let sessions = SessionStore::new(db, &self.cfg.session_secret)?;
        Ok(auth::routes(
            OAuthSettings::from_config(&self.cfg),
            &self.cfg.redirect_path(),
            Arc::new(self.platform.clone()),
            Arc::new(sessions),
        ))
    }

    fn build_manager(&self, db: &Database) -> Result<ManagerAssembly> {
        Ok(ManagerBuilder::new(
            &self.cfg,
            SubscriptionStore::new(db),
            Arc::new(self.platform.clone()),
            Arc::new(self.platform.clone()),
        )
        .build())
    }

    fn app_routes(&self, db: &Database, context: RouteContext) -> Result<Router> {
        Ok(router::build(AppState {
            sessions: SessionStore::new(db, &self.cfg.session_secret)?,
            manager: context.manager,
            messages: context.messages,
            phase: context.phase,
            activation: context.activation,
        }))
    }

    fn seeder(&self) -> Arc<dyn Seeder> {
        Arc::new(TopStreamsSeeder::new(
            Arc::new(self.platform.clone()),
            self.cfg.seed_count,
        ))
    }
}

/// The startup sequencer.
pub struct Startup {
    http_addr: SocketAddr,
    https_addr: SocketAddr,
    tls: TlsPaths,
    step_timeout: Duration,
    phase: Arc<PhaseTracker>,
}

impl Startup {
    pub fn new(cfg: &Config, phase: Arc<PhaseTracker>) -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], cfg.http_port)),
            https_addr: SocketAddr::from(([0, 0, 0, 0], cfg.https_port)),
            tls: cfg.tls_paths(),
            step_timeout: cfg.shutdown_step_timeout(),
            phase,
        }
    }

    /// Run every startup step in order.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`StartupError`]; resources acquired before it
    /// have been released by then.
    pub async fn run<S: Subsystems>(self, subsystems: &S) -> Result<Running, StartupError> {
        let db = subsystems
            .open_persistence()
            .await
            .map_err(StartupError::PersistenceOpen)?;
        db.sync().await.map_err(StartupError::PersistenceSync)?;
        self.phase.advance(LifecyclePhase::PersistenceReady)?;

        let mut acquired = AcquiredResources {
            persistence: Some(Arc::clone(&db) as Arc<dyn Persistence>),
            ..AcquiredResources::default()
        };

        let auth_routes = match subsystems.auth_routes(&db) {
            Ok(routes) => routes,
            Err(e) => return Err(self.release(acquired, StartupError::AuthRoutes(e)).await),
        };

        let ManagerAssembly {
            manager,
            scheduler,
            events,
            routes: callback_routes,
        } = match subsystems.build_manager(&db) {
            Ok(assembly) => assembly,
            Err(e) => {
                let err = StartupError::ManagerConstruction(e);
                return Err(self.release(acquired, err).await);
            }
        };
        acquired.manager = Some(Arc::clone(&manager));
        if let Err(e) = scheduler.attach(&manager) {
            let err = StartupError::ManagerConstruction(e.into());
            return Err(self.release(acquired, err).await);
        }

        let messages = MessageLog::default();
        handlers::spawn_event_pump(
            events,
            handlers::message_handler(messages.clone()),
            handlers::error_handler(),
        );

        let hook = ActivationHook::new(Arc::clone(&manager), subsystems.seeder());
        let context = RouteContext {
            manager: Arc::clone(&manager),
            messages,
            phase: self.phase.subscribe(),
            activation: hook.status(),
        };
        let app_routes = match subsystems.app_routes(&db, context) {
            Ok(routes) => routes,
            Err(e) => return Err(self.release(acquired, StartupError::AppRoutes(e)).await),
        };
        let app = middleware::apply(
            Router::new()
                .merge(auth_routes)
                .merge(callback_routes)
                .merge(app_routes),
        );

        let server_config = match TlsMaterial::load(&self.tls).await {
            Ok(Some(material)) => match material.server_config() {
                Ok(config) => Some(config),
                Err(e) => {
                    error!(
                        error = %format!("{e:#}"),
                        "TLS material rejected; encrypted listener disabled"
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "TLS material unreadable; encrypted listener disabled");
                None
            }
        };

        match PlainListener::bind(self.http_addr, app.clone()).await {
            Ok(listener) => acquired.plain_listener = Some(Box::new(listener)),
            Err(e) => return Err(self.release(acquired, StartupError::PlainBind(e)).await),
        }
        if let Err(e) = self.phase.advance(LifecyclePhase::Listening) {
            return Err(self.release(acquired, e.into()).await);
        }

        let activation_task = match server_config {
            Some(config) => match TlsListener::bind(self.https_addr, app, config).await {
                Ok(listener) => {
                    acquired.encrypted_listener = Some(Box::new(listener));
                    hook.on_bound()
                }
                Err(e) => return Err(self.release(acquired, StartupError::EncryptedBind(e)).await),
            },
            None => {
                hook.disable();
                None
            }
        };
        if let Err(e) = self.phase.advance(LifecyclePhase::Active) {
            return Err(self.release(acquired, e.into()).await);
        }

        let running = Running {
            plain_addr: addr_of(&acquired.plain_listener),
            encrypted_addr: acquired.encrypted_listener.as_ref().map(|l| l.local_addr()),
            resources: acquired,
            activation: hook.status(),
            activation_task,
        };
        info!(
            http = ?running.plain_addr,
            https = ?running.encrypted_addr,
            "startup complete"
        );
        Ok(running)
    }

    async fn release(&self, acquired: AcquiredResources, err: StartupError) -> StartupError {
        error!(error = %err, "startup failed; releasing acquired resources");
        let report = ShutdownSequencer::new(self.step_timeout).run(acquired).await;
        for (step, e) in report.failures() {
            warn!(step = %step, error = %e, "release after failed startup incomplete");
        }
        err
    }
}

fn addr_of(listener: &Option<Box<dyn ListenerHandle>>) -> Option<SocketAddr> {
    listener.as_ref().map(|l| l.local_addr())
}

/// A fully started process.
pub struct Running {
    resources: AcquiredResources,
    plain_addr: Option<SocketAddr>,
    encrypted_addr: Option<SocketAddr>,
    activation: watch::Receiver<ActivationStatus>,
    activation_task: Option<JoinHandle<()>>,
}

impl Running {
    pub fn plain_addr(&self) -> Option<SocketAddr> {
        self.plain_addr
    }

    pub fn encrypted_addr(&self) -> Option<SocketAddr> {
        self.encrypted_addr
    }

    pub fn activation(&self) -> watch::Receiver<ActivationStatus> {
        self.activation.clone()
    }

    /// Stop an unfinished activation, then run the teardown sequence.
    pub async fn shutdown(self, sequencer: &ShutdownSequencer) -> ShutdownReport {
        if let Some(task) = self.activation_task {
            if !task.is_finished() {
                warn!("activation still running at shutdown; cancelling it");
                task.abort();
            }
        }
        sequencer.run(self.resources).await
    }
}
