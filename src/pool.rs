//! Pool of supervised apps keyed by name
//!
//! The pool owns at most one [`App`] per name. Lookups that miss consult the
//! registry, insert the new app and start it; concurrent first requests for
//! the same name share a single app and therefore a single launch.

use crate::app::{App, AppSettings, AppState};
use crate::config::AppsConfig;
use crate::error::AppError;
use crate::events::{EventSink, StopReason};
use crate::registry::{AppRegistry, RegistryError};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Lookups repeated when a purge retires the app mid-launch
const MAX_RETIRED_RETRIES: usize = 3;

/// Lifecycle settings for every app in the pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub app: AppSettings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_config(&AppsConfig::default())
    }
}

impl PoolConfig {
    pub fn from_config(config: &AppsConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            reap_interval: config.reap_interval(),
            app: AppSettings::from_config(config),
        }
    }
}

pub struct AppPool {
    apps: DashMap<String, Arc<App>>,
    registry: Arc<dyn AppRegistry>,
    events: Arc<dyn EventSink>,
    config: PoolConfig,
}

impl AppPool {
    pub fn new(registry: Arc<dyn AppRegistry>, events: Arc<dyn EventSink>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            apps: DashMap::new(),
            registry,
            events,
            config,
        })
    }

    /// Resolve `name` to a Running app, starting it if needed
    pub async fn app(&self, name: &str) -> Result<Arc<App>, AppError> {
        self.ensure_current(name).await.map(|(app, _)| app)
    }

    /// Shorthand for [`AppPool::app`] that only returns the address
    pub async fn resolve(&self, name: &str) -> Result<SocketAddr, AppError> {
        self.ensure_current(name).await.map(|(_, addr)| addr)
    }

    /// Ensure the app currently registered under `name`. An app retired by a
    /// purge between lookup and launch is dropped and the name looked up again.
    async fn ensure_current(&self, name: &str) -> Result<(Arc<App>, SocketAddr), AppError> {
        for _ in 0..MAX_RETIRED_RETRIES {
            let app = self.get_or_create(name)?;
            if let Some(addr) = app.try_ensure().await? {
                return Ok((app, addr));
            }
            debug!(name, "App retired while starting, looking it up again");
        }
        Err(AppError::StartFailure {
            name: name.to_string(),
            reason: "app was purged while starting".to_string(),
            output: Vec::new(),
        })
    }

    fn get_or_create(&self, name: &str) -> Result<Arc<App>, AppError> {
        if let Some(app) = self.apps.get(name) {
            return Ok(Arc::clone(app.value()));
        }

        // Registry access may hit the filesystem, keep it out of the map lock
        let spec = self.registry.lookup(name).map_err(|e| match e {
            RegistryError::NotFound(name) => AppError::UnknownApp(name),
            other => AppError::StartFailure {
                name: name.to_string(),
                reason: other.to_string(),
                output: Vec::new(),
            },
        })?;

        let app = self
            .apps
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name, "Registering app");
                App::new(name, spec, self.config.app.clone(), Arc::clone(&self.events))
            })
            .value()
            .clone();
        Ok(app)
    }

    /// Look up an app without starting it
    pub fn get(&self, name: &str) -> Option<Arc<App>> {
        self.apps.get(name).map(|app| Arc::clone(app.value()))
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Names of apps currently Running
    pub fn running(&self) -> Vec<String> {
        self.apps
            .iter()
            .filter(|entry| entry.value().state() == AppState::Running)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Stop every app and forget them all. Safe to call repeatedly.
    ///
    /// Removed apps are retired so a request still holding one cannot start
    /// a process the pool no longer tracks.
    pub async fn purge(&self) {
        let names: Vec<String> = self.apps.iter().map(|entry| entry.key().clone()).collect();
        let apps: Vec<Arc<App>> = names
            .iter()
            .filter_map(|name| self.apps.remove(name).map(|(_, app)| app))
            .collect();

        if apps.is_empty() {
            return;
        }

        info!(count = apps.len(), "Purging apps");
        let stops = apps.iter().map(|app| app.retire(StopReason::Purge));
        let stopped = futures::future::join_all(stops).await;
        debug!(stopped = stopped.into_iter().filter(|s| *s).count(), "Purge complete");
    }

    /// One reaper pass: stop apps idle longer than the idle timeout.
    /// Apps that are mid-launch or mid-stop are skipped until the next pass.
    /// Returns the number of apps stopped.
    pub async fn reap_idle(&self) -> usize {
        let apps: Vec<Arc<App>> = self.apps.iter().map(|entry| Arc::clone(entry.value())).collect();

        let checks = apps.iter().map(|app| app.stop_if_idle(self.config.idle_timeout));
        let stopped = futures::future::join_all(checks).await.into_iter().filter(|s| *s).count();
        if stopped > 0 {
            info!(stopped, "Reaped idle apps");
        }
        stopped
    }

    /// Run [`AppPool::reap_idle`] every reap interval until `shutdown` fires
    pub fn spawn_reaper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let interval = pool.config.reap_interval;
            debug!(interval_secs = interval.as_secs_f64(), "Idle reaper started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        pool.reap_idle().await;
                    }
                    _ = shutdown.changed() => {
                        debug!("Idle reaper stopping");
                        break;
                    }
                }
            }
        })
    }
}
