//! Service lifecycle: assembles the registry, store, scheduler and query
//! engine from one configuration and owns the background refresh loop and
//! every crawl run started through it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::ServerConfig;
use crate::crawl::{CrawlReport, CrawlScheduler, StopSignal};
use crate::error::{DocsError, Result};
use crate::mcp::DocsServer;
use crate::provider::ProviderRegistry;
use crate::query::QueryEngine;
use crate::store::{DocumentStore, IndexedStore, StoreOptions};

const DRAIN_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Disabled,
    Unsupported,
    Stopped,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Disabled => "disabled",
            Self::Unsupported => "unsupported",
            Self::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub status: HealthStatus,
    pub enabled: bool,
    pub last_crawl: Option<DateTime<Utc>>,
    pub document_count: usize,
    /// First problem of the last crawl, if it had one.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreHealth {
    pub status: HealthStatus,
    pub documents: usize,
    pub writes: u64,
    pub last_write: Option<DateTime<Utc>>,
    pub persistent: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub state: ServiceState,
    pub providers: Vec<ProviderHealth>,
    pub store: StoreHealth,
}

impl fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "service: {} ({:?})", self.status, self.state)?;
        writeln!(
            f,
            "store: {}, {} documents, {} writes{}",
            self.store.status,
            self.store.documents,
            self.store.writes,
            if self.store.persistent { ", persistent" } else { "" }
        )?;
        if let Some(error) = &self.store.last_error {
            writeln!(f, "  last error: {error}")?;
        }
        for p in &self.providers {
            let last_crawl = p
                .last_crawl
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            writeln!(
                f,
                "{:<16} {:<12} documents: {:<6} last crawl: {last_crawl}",
                p.name, p.status, p.document_count
            )?;
            if let Some(error) = &p.last_error {
                writeln!(f, "  last error: {error}")?;
            }
        }
        Ok(())
    }
}

struct TrackedRun {
    stop: StopSignal,
    abort: AbortHandle,
}

/// Forgets a tracked run even when the caller stops awaiting it.
struct Untrack<'a> {
    runs: &'a DashMap<u64, TrackedRun>,
    id: u64,
}

impl Drop for Untrack<'_> {
    fn drop(&mut self) {
        self.runs.remove(&self.id);
    }
}

struct RefreshLoop {
    stop: StopSignal,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct ServiceInner {
    config: ServerConfig,
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn DocumentStore>,
    scheduler: Arc<CrawlScheduler>,
    engine: QueryEngine,
    state: SyncMutex<ServiceState>,
    runs: DashMap<u64, TrackedRun>,
    next_run: AtomicU64,
    refresh: SyncMutex<Option<RefreshLoop>>,
    store_error: SyncMutex<Option<String>>,
}

/// The documentation service. Cheap to clone; clones share one service.
#[derive(Clone)]
pub struct DocsService {
    inner: Arc<ServiceInner>,
}

impl DocsService {
    /// Builds every component from `config` with an [`IndexedStore`].
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ProviderRegistry::from_config(&config)?);
        let store = Arc::new(IndexedStore::new(StoreOptions::from_config(&config)));
        Ok(Self::with_parts(config, registry, store))
    }

    /// Builds the service around an existing registry and store.
    pub fn with_parts(
        config: ServerConfig,
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let scheduler = Arc::new(CrawlScheduler::new(registry.clone(), store.clone(), &config));
        let engine = QueryEngine::new(registry.clone(), store.clone(), config.search.clone());
        Self {
            inner: Arc::new(ServiceInner {
                config,
                registry,
                store,
                scheduler,
                engine,
                state: SyncMutex::new(ServiceState::Created),
                runs: DashMap::new(),
                next_run: AtomicU64::new(0),
                refresh: SyncMutex::new(None),
                store_error: SyncMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.inner.store.clone()
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.inner.engine
    }

    /// A fresh MCP handler over this service's query engine.
    pub fn mcp_server(&self) -> DocsServer {
        DocsServer::new(self.inner.engine.clone())
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state.lock().map(|s| *s).unwrap_or(ServiceState::Stopped)
    }

    fn set_state(&self, next: ServiceState) {
        if let Ok(mut state) = self.inner.state.lock() {
            *state = next;
        }
    }

    fn record_store_result(&self, result: &Result<()>) {
        if let Ok(mut last) = self.inner.store_error.lock() {
            *last = result.as_ref().err().map(|e| e.to_string());
        }
    }

    /// Loads persisted documents and starts the refresh loop when an
    /// interval is configured. Returns the number of documents loaded.
    pub async fn start(&self) -> Result<usize> {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .map_err(|_| DocsError::Store("service state is poisoned".into()))?;
            if *state != ServiceState::Created {
                return Err(DocsError::InvalidArgument(format!(
                    "start: service is already {:?}",
                    *state
                )));
            }
            *state = ServiceState::Running;
        }

        let loaded = self.inner.store.load().await.inspect_err(|e| {
            tracing::error!("failed to load document store: {e}");
        })?;
        tracing::info!(
            "documentation service started: {} tools, {loaded} documents",
            self.inner.registry.len()
        );

        if let Some(secs) = self.inner.config.crawl.refresh_interval_secs.filter(|s| *s > 0) {
            self.spawn_refresh(Duration::from_secs(secs));
        }
        Ok(loaded)
    }

    fn spawn_refresh(&self, interval: Duration) {
        let stop = StopSignal::new();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let service = self.clone();
        let loop_stop = stop.clone();
        let handle = tokio::spawn(async move {
            tracing::info!("refresh loop running every {}s", interval.as_secs());
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
                if loop_stop.is_stopped() {
                    break;
                }
                match service.run_crawl(Vec::new(), false, loop_stop.clone()).await {
                    Ok(report) => {
                        tracing::info!(
                            "refresh finished: {} stored, {} skipped, {} failed",
                            report.stored(),
                            report.skipped(),
                            report.failed()
                        );
                        if report.stored() > 0 || report.skipped() > 0 {
                            let saved = service.inner.store.save().await;
                            if let Err(e) = &saved {
                                tracing::error!("failed to persist document store: {e}");
                            }
                            service.record_store_result(&saved);
                        }
                    }
                    Err(e) => tracing::warn!("refresh crawl did not run: {e}"),
                }
            }
            tracing::info!("refresh loop stopped");
        });
        if let Ok(mut refresh) = self.inner.refresh.lock() {
            *refresh = Some(RefreshLoop {
                stop,
                shutdown,
                handle,
            });
        }
    }

    /// Crawls `tools` (every enabled tool when empty). `force` ignores
    /// cache lifetimes and freshness probes. The run can be cancelled by
    /// [`stop`](Self::stop).
    pub async fn crawl(&self, tools: &[String], force: bool) -> Result<CrawlReport> {
        self.run_crawl(tools.to_vec(), force, StopSignal::new()).await
    }

    async fn run_crawl(&self, tools: Vec<String>, force: bool, stop: StopSignal) -> Result<CrawlReport> {
        let id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        // Tracked under the state lock so a concurrent stop either sees the
        // run or the run sees the stop.
        let handle = {
            let state = self
                .inner
                .state
                .lock()
                .map_err(|_| DocsError::Store("service state is poisoned".into()))?;
            if matches!(*state, ServiceState::Stopping | ServiceState::Stopped) {
                return Err(DocsError::Cancelled("crawl: service is stopping".into()));
            }
            let scheduler = self.inner.scheduler.clone();
            let run_stop = stop.clone();
            let handle = tokio::spawn(async move { scheduler.crawl(&tools, force, &run_stop).await });
            self.inner.runs.insert(
                id,
                TrackedRun {
                    stop,
                    abort: handle.abort_handle(),
                },
            );
            handle
        };

        let _untrack = Untrack {
            runs: &self.inner.runs,
            id,
        };
        match handle.await {
            Ok(report) => report,
            Err(e) if e.is_cancelled() => Err(DocsError::Cancelled("crawl".into())),
            Err(e) => Err(DocsError::Store(format!("crawl run failed: {e}"))),
        }
    }

    /// Number of crawl runs in flight.
    pub fn active_crawls(&self) -> usize {
        self.inner.runs.len()
    }

    /// Stops the refresh loop and every tracked crawl run. A graceful stop
    /// lets dequeued jobs finish and then persists the store; otherwise the
    /// runs are aborted and nothing is saved.
    pub async fn stop(&self, graceful: bool) -> Result<()> {
        if self.state() == ServiceState::Stopped {
            return Ok(());
        }
        self.set_state(ServiceState::Stopping);
        tracing::info!("stopping documentation service (graceful: {graceful})");

        let refresh = self.inner.refresh.lock().ok().and_then(|mut r| r.take());
        for run in self.inner.runs.iter() {
            run.stop.stop();
            if !graceful {
                run.abort.abort();
            }
        }

        if let Some(refresh) = refresh {
            refresh.stop.stop();
            let _ = refresh.shutdown.send(true);
            if graceful {
                if let Err(e) = refresh.handle.await {
                    tracing::warn!("refresh loop ended abnormally: {e}");
                }
            } else {
                refresh.handle.abort();
            }
        }

        let result = if graceful {
            while !self.inner.runs.is_empty() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
            let saved = self.inner.store.save().await;
            self.record_store_result(&saved);
            saved
        } else {
            Ok(())
        };

        self.set_state(ServiceState::Stopped);
        tracing::info!("documentation service stopped");
        result
    }

    /// Health of every registered provider and of the store.
    pub async fn get_health(&self) -> ServiceHealth {
        let state = self.state();
        let mut providers = Vec::with_capacity(self.inner.registry.len());
        for registration in self.inner.registry.iter() {
            let report = self.inner.scheduler.last_report(&registration.name);
            let last_error = report.as_ref().and_then(|r| {
                r.unsupported
                    .clone()
                    .or_else(|| r.listing_errors.first().cloned())
                    .or_else(|| r.failures.first().map(|f| format!("{}: {}", f.location, f.error)))
            });
            let status = if !registration.is_supported() {
                HealthStatus::Unsupported
            } else if !registration.settings.enabled {
                HealthStatus::Disabled
            } else if report.as_ref().is_some_and(|r| !r.is_clean()) {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };
            providers.push(ProviderHealth {
                name: registration.name.clone(),
                status,
                enabled: registration.settings.enabled,
                last_crawl: report.map(|r| r.finished_at),
                document_count: self.inner.store.document_count(&registration.name).await,
                last_error,
            });
        }

        let stats = self.inner.store.stats().await;
        let store_error = self.inner.store_error.lock().ok().and_then(|e| e.clone());
        let store = StoreHealth {
            status: if store_error.is_some() {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            documents: stats.documents,
            writes: stats.writes,
            last_write: stats.last_write,
            persistent: stats.persist_dir.is_some(),
            last_error: store_error,
        };

        let status = if matches!(state, ServiceState::Stopping | ServiceState::Stopped) {
            HealthStatus::Stopped
        } else if store.status != HealthStatus::Healthy
            || providers.iter().any(|p| p.status == HealthStatus::Degraded)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ServiceHealth {
            status,
            state,
            providers,
            store,
        }
    }
}
