//! Crawl scheduler.
//!
//! A crawl run lists every section of each requested provider, turns each
//! listed location into a job and drains the jobs with a bounded set of
//! workers per provider. Providers run concurrently; within a provider jobs
//! are dequeued in listing order. Job failures are recorded in the run
//! report and never abort sibling jobs.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until, timeout};

use crate::config::ServerConfig;
use crate::document::DocumentMeta;
use crate::error::{DocsError, Result};
use crate::provider::{ProviderRegistration, ProviderRegistry};
use crate::retry::MAX_RETRY_AFTER;
use crate::store::{DocumentStore, UpsertOutcome};

/// Cooperative stop flag shared by a crawl run and whoever may cancel it.
/// Once set, workers dequeue no new jobs; jobs already running finish.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Lifecycle of one crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Pending,
    Fetching,
    Normalizing,
    Stored,
    Skipped,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stored | Self::Skipped | Self::Failed)
    }
}

/// Why a job ended without writing to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// Fetched less than the tool's cache TTL ago.
    Fresh,
    /// The provider's freshness probe matched the stored validators.
    Unmodified,
    /// Fetched content hashes the same as the stored document.
    Unchanged,
    /// Upstream reports the location gone; the stored document was deleted.
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Stored(UpsertOutcome),
    Skipped(SkipReason),
    Failed(DocsError),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            Self::Stored(_) => JobState::Stored,
            Self::Skipped(_) => JobState::Skipped,
            Self::Failed(_) => JobState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub location: String,
    pub error: String,
}

/// Outcome counts of one provider within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderReport {
    pub tool: String,
    /// Distinct locations listed across the provider's sections.
    pub jobs: usize,
    pub stored: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Skipped jobs whose document was deleted because upstream dropped it.
    pub removed: usize,
    /// Stored documents deleted because their location is no longer listed.
    pub pruned: usize,
    /// Jobs never dequeued because the run was stopped.
    pub not_started: usize,
    pub listing_errors: Vec<String>,
    /// Set when the provider declares a capability it does not implement.
    pub unsupported: Option<String>,
    pub failures: Vec<JobFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ProviderReport {
    fn new(tool: &str) -> Self {
        let now = Utc::now();
        Self {
            tool: tool.to_string(),
            jobs: 0,
            stored: 0,
            skipped: 0,
            failed: 0,
            removed: 0,
            pruned: 0,
            not_started: 0,
            listing_errors: Vec::new(),
            unsupported: None,
            failures: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    fn record(&mut self, location: String, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Stored(_) => self.stored += 1,
            JobOutcome::Skipped(reason) => {
                self.skipped += 1;
                if reason == SkipReason::Removed {
                    self.removed += 1;
                }
            }
            JobOutcome::Failed(error) => {
                self.failed += 1;
                self.failures.push(JobFailure {
                    location,
                    error: error.to_string(),
                });
            }
        }
    }

    /// Jobs that reached a terminal state.
    pub fn finished(&self) -> usize {
        self.stored + self.skipped + self.failed
    }

    /// Healthy when listing worked and no job failed.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.listing_errors.is_empty() && self.unsupported.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrawlReport {
    pub providers: Vec<ProviderReport>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CrawlReport {
    pub fn provider(&self, tool: &str) -> Option<&ProviderReport> {
        self.providers.iter().find(|p| p.tool == tool)
    }

    pub fn stored(&self) -> usize {
        self.providers.iter().map(|p| p.stored).sum()
    }

    pub fn skipped(&self) -> usize {
        self.providers.iter().map(|p| p.skipped).sum()
    }

    pub fn failed(&self) -> usize {
        self.providers.iter().map(|p| p.failed).sum()
    }

    pub fn jobs(&self) -> usize {
        self.providers.iter().map(|p| p.jobs).sum()
    }
}

impl fmt::Display for CrawlReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<16} {:>6} {:>7} {:>7} {:>6} {:>7} {:>11}",
            "tool", "jobs", "stored", "skipped", "failed", "removed", "not_started"
        )?;
        for p in &self.providers {
            writeln!(
                f,
                "{:<16} {:>6} {:>7} {:>7} {:>6} {:>7} {:>11}",
                p.tool, p.jobs, p.stored, p.skipped, p.failed, p.removed, p.not_started
            )?;
        }
        for p in &self.providers {
            if let Some(reason) = &p.unsupported {
                writeln!(f, "{}: unsupported: {reason}", p.tool)?;
            }
            if p.pruned > 0 {
                writeln!(f, "{}: pruned {} documents no longer listed", p.tool, p.pruned)?;
            }
            for error in &p.listing_errors {
                writeln!(f, "{}: listing failed: {error}", p.tool)?;
            }
            for failure in &p.failures {
                writeln!(f, "{}: {} failed: {}", p.tool, failure.location, failure.error)?;
            }
        }
        write!(
            f,
            "total: {} jobs, {} stored, {} skipped, {} failed{}",
            self.jobs(),
            self.stored(),
            self.skipped(),
            self.failed(),
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}

#[derive(Debug, Clone)]
struct SchedulerSettings {
    default_concurrency: usize,
    fetch_timeout: Duration,
    rate_limit_attempts: u32,
}

/// Runs crawls against the registered providers and remembers the last
/// report of each provider.
pub struct CrawlScheduler {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn DocumentStore>,
    settings: SchedulerSettings,
    history: DashMap<String, ProviderReport>,
}

impl CrawlScheduler {
    pub fn new(registry: Arc<ProviderRegistry>, store: Arc<dyn DocumentStore>, config: &ServerConfig) -> Self {
        Self {
            registry,
            store,
            settings: SchedulerSettings {
                default_concurrency: config.crawl.concurrency.max(1),
                fetch_timeout: config.crawl.fetch_timeout(),
                rate_limit_attempts: config.crawl.max_retries.max(1),
            },
            history: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Report of the last finished crawl of `tool`.
    pub fn last_report(&self, tool: &str) -> Option<ProviderReport> {
        self.history.get(tool).map(|entry| entry.value().clone())
    }

    /// Crawls `tools`, or every enabled tool when empty. Unknown tool names
    /// are rejected before anything runs; everything after that is
    /// reported, never raised.
    pub async fn crawl(&self, tools: &[String], force: bool, stop: &StopSignal) -> Result<CrawlReport> {
        let targets: Vec<&ProviderRegistration> = if tools.is_empty() {
            self.registry.enabled().collect()
        } else {
            let mut seen = HashSet::new();
            let mut targets = Vec::new();
            for name in tools {
                let registration = self.registry.get(name).ok_or_else(|| {
                    DocsError::InvalidArgument(format!(
                        "crawl: unknown tool '{name}'; available: {}",
                        self.registry.names().collect::<Vec<_>>().join(", ")
                    ))
                })?;
                if seen.insert(name.as_str()) {
                    targets.push(registration);
                }
            }
            targets
        };

        let started_at = Utc::now();
        tracing::info!("crawl started for {} tools (force: {force})", targets.len());
        let providers = join_all(targets.into_iter().map(|r| self.crawl_provider(r, force, stop))).await;
        for report in &providers {
            self.history.insert(report.tool.clone(), report.clone());
        }

        let report = CrawlReport {
            providers,
            cancelled: stop.is_stopped(),
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            "crawl finished: {} jobs, {} stored, {} skipped, {} failed{}",
            report.jobs(),
            report.stored(),
            report.skipped(),
            report.failed(),
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    async fn crawl_provider(
        &self,
        registration: &ProviderRegistration,
        force: bool,
        stop: &StopSignal,
    ) -> ProviderReport {
        let mut report = ProviderReport::new(&registration.name);
        if !registration.settings.enabled {
            report.listing_errors.push("tool is disabled in the configuration".to_string());
            report.finished_at = Utc::now();
            return report;
        }

        let locations = self.list_all(registration, stop, &mut report).await;
        report.jobs = locations.len();
        let listed: HashSet<String> = locations.iter().cloned().collect();

        let run = ProviderRun {
            registration,
            store: self.store.as_ref(),
            settings: &self.settings,
            force,
            queue: Mutex::new(locations.into_iter().enumerate().collect()),
            results: Mutex::new(Vec::new()),
            throttle_until: Mutex::new(None),
        };
        let workers = self
            .registration_concurrency(registration)
            .min(report.jobs.max(1));
        join_all((0..workers).map(|_| run.worker(stop))).await;

        report.not_started = run.queue.lock().await.len();
        let mut results = std::mem::take(&mut *run.results.lock().await);
        results.sort_by_key(|(index, _, _)| *index);
        for (_, location, outcome) in results {
            report.record(location, outcome);
        }
        if report.jobs > 0 && report.not_started == 0 && report.is_clean() && !stop.is_stopped() {
            report.pruned = self.prune(&registration.name, &listed).await;
        }
        report.finished_at = Utc::now();

        if report.is_clean() {
            tracing::info!(
                "{}: {} stored, {} skipped, {} not started",
                report.tool,
                report.stored,
                report.skipped,
                report.not_started
            );
        } else {
            tracing::warn!(
                "{}: {} stored, {} skipped, {} failed, {} listing errors",
                report.tool,
                report.stored,
                report.skipped,
                report.failed,
                report.listing_errors.len()
            );
        }
        report
    }

    fn registration_concurrency(&self, registration: &ProviderRegistration) -> usize {
        registration
            .settings
            .concurrency
            .unwrap_or(self.settings.default_concurrency)
            .max(1)
    }

    /// Deletes documents of `tool` whose location the last listing did not
    /// return.
    async fn prune(&self, tool: &str, listed: &HashSet<String>) -> usize {
        let mut pruned = 0;
        for meta in self.store.list_metadata(tool).await {
            if listed.contains(&meta.url) {
                continue;
            }
            match self.store.delete(tool, &meta.url).await {
                Ok(true) => {
                    tracing::debug!("{tool}: pruned {}", meta.url);
                    pruned += 1;
                }
                Ok(false) => {}
                Err(err) => tracing::error!("{tool}: cannot prune {}: {err}", meta.url),
            }
        }
        pruned
    }

    /// Locations of every section, deduplicated, in listing order.
    async fn list_all(
        &self,
        registration: &ProviderRegistration,
        stop: &StopSignal,
        report: &mut ProviderReport,
    ) -> Vec<String> {
        let sections = if registration.settings.sections.is_empty() {
            vec![String::new()]
        } else {
            registration.settings.sections.clone()
        };

        let mut seen = HashSet::new();
        let mut locations = Vec::new();
        for section in &sections {
            if stop.is_stopped() {
                break;
            }
            match registration.provider.list_locations(section).await {
                Ok(listed) => {
                    for location in listed {
                        if seen.insert(location.clone()) {
                            locations.push(location);
                        }
                    }
                }
                Err(DocsError::NotImplementedCapability { capability, .. }) => {
                    tracing::info!("{}: {capability} is not implemented, skipping", registration.name);
                    report.unsupported = Some(format!("{capability} is not implemented"));
                    break;
                }
                Err(err) => {
                    tracing::warn!("{}: listing section '{section}' failed: {err}", registration.name);
                    report.listing_errors.push(format!("section '{section}': {err}"));
                }
            }
        }
        locations
    }
}

/// Shared state of one provider's workers during a run.
struct ProviderRun<'a> {
    registration: &'a ProviderRegistration,
    store: &'a dyn DocumentStore,
    settings: &'a SchedulerSettings,
    force: bool,
    queue: Mutex<VecDeque<(usize, String)>>,
    results: Mutex<Vec<(usize, String, JobOutcome)>>,
    /// Set when upstream rate limits; every worker waits it out.
    throttle_until: Mutex<Option<Instant>>,
}

impl ProviderRun<'_> {
    fn tool(&self) -> &str {
        &self.registration.name
    }

    async fn worker(&self, stop: &StopSignal) {
        loop {
            if stop.is_stopped() {
                break;
            }
            let Some((index, location)) = self.queue.lock().await.pop_front() else {
                break;
            };
            tracing::debug!("{}: {location} {:?}", self.tool(), JobState::Pending);
            let outcome = self.run_job(&location).await;
            tracing::debug!("{}: {location} {:?}", self.tool(), outcome.state());
            if let JobOutcome::Failed(err) = &outcome {
                tracing::warn!("{}: job {location} failed: {err}", self.tool());
            }
            self.results.lock().await.push((index, location, outcome));
        }
    }

    async fn wait_for_throttle(&self) {
        let until = *self.throttle_until.lock().await;
        if let Some(until) = until {
            sleep_until(until).await;
        }
    }

    async fn throttle(&self, retry_after: Duration) {
        let Some(until) = Instant::now().checked_add(retry_after.min(MAX_RETRY_AFTER)) else {
            return;
        };
        let mut current = self.throttle_until.lock().await;
        if current.is_none_or(|existing| existing < until) {
            *current = Some(until);
        }
    }

    /// Fetched within the tool's cache TTL. A TTL too large to add to the
    /// fetch time never expires.
    fn is_fresh(&self, meta: &DocumentMeta) -> bool {
        let ttl = self.registration.settings.cache_ttl();
        if ttl.is_zero() {
            return false;
        }
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| meta.fetched_at.checked_add_signed(ttl))
            .is_none_or(|expires| expires > Utc::now())
    }

    async fn remove(&self, location: &str) -> JobOutcome {
        tracing::debug!("{}: {location} is gone upstream", self.tool());
        match self.store.delete(self.tool(), location).await {
            Ok(_) => JobOutcome::Skipped(SkipReason::Removed),
            Err(err) => {
                tracing::error!("{}: cannot delete {location}: {err}", self.tool());
                JobOutcome::Failed(err)
            }
        }
    }

    async fn run_job(&self, location: &str) -> JobOutcome {
        let provider = self.registration.provider.as_ref();
        let existing = self.store.metadata(self.tool(), location).await;

        if !self.force {
            if let Some(meta) = &existing {
                if self.is_fresh(meta) {
                    return JobOutcome::Skipped(SkipReason::Fresh);
                }
                if let Some(stored_tag) = &meta.freshness {
                    match timeout(self.settings.fetch_timeout, provider.probe(location)).await {
                        Ok(Ok(Some(tag))) if stored_tag.matches(&tag) => {
                            return JobOutcome::Skipped(SkipReason::Unmodified);
                        }
                        Ok(Err(DocsError::NotFound { .. })) => return self.remove(location).await,
                        Ok(Err(err)) => {
                            tracing::debug!("{}: probe of {location} failed: {err}", self.tool());
                        }
                        _ => {}
                    }
                }
            }
        }

        tracing::debug!("{}: {location} {:?}", self.tool(), JobState::Fetching);
        let mut attempt = 1;
        let raw = loop {
            self.wait_for_throttle().await;
            match timeout(self.settings.fetch_timeout, provider.fetch(location)).await {
                Err(_) => {
                    return JobOutcome::Failed(DocsError::source_unavailable(
                        self.tool(),
                        format!("fetch of {location} timed out after {:?}", self.settings.fetch_timeout),
                    ));
                }
                Ok(Ok(raw)) => break raw,
                Ok(Err(DocsError::NotFound { .. })) => return self.remove(location).await,
                Ok(Err(DocsError::RateLimited { retry_after, .. }))
                    if attempt < self.settings.rate_limit_attempts =>
                {
                    tracing::info!(
                        "{}: rate limited, backing off for {retry_after:?} (attempt {attempt})",
                        self.tool()
                    );
                    self.throttle(retry_after).await;
                    attempt += 1;
                }
                Ok(Err(err)) => return JobOutcome::Failed(err),
            }
        };

        tracing::debug!("{}: {location} {:?}", self.tool(), JobState::Normalizing);
        let doc = match provider.normalize(&raw) {
            Ok(doc) => doc,
            Err(err) => return JobOutcome::Failed(err),
        };
        if let Some(meta) = existing
            .as_ref()
            .filter(|meta| meta.content_hash == doc.content_hash)
        {
            if doc.freshness.is_some() && meta.freshness != doc.freshness {
                if let Err(err) = self
                    .store
                    .refresh_freshness(self.tool(), location, doc.freshness.clone())
                    .await
                {
                    tracing::warn!("{}: cannot refresh validators of {location}: {err}", self.tool());
                }
            }
            return JobOutcome::Skipped(SkipReason::Unchanged);
        }

        match self.store.upsert(doc).await {
            Ok(UpsertOutcome::Unchanged) => JobOutcome::Skipped(SkipReason::Unchanged),
            Ok(outcome) => JobOutcome::Stored(outcome),
            Err(err) => {
                tracing::error!("{}: cannot store {location}: {err}", self.tool());
                JobOutcome::Failed(err)
            }
        }
    }
}
