//! Owns the storage model between probes and user edits.
//!
//! A probe cycle tries the full probe kinds first and falls back to the
//! restricted (block devices only) kinds. Each attempt runs as a
//! cancel-restart task bounded by the probe timeout; a failed attempt
//! files a crash report and the cycle moves on. While the model is locked
//! for editing, probe results are queued and only applied by `reset`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use serde::Serialize;
use storage_planner_core::probe::{full_kinds, restricted_kinds};
use storage_planner_core::{model_from_probe_data, Bootloader, ProbeData, ProbeKind, StorageModel};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::events::DeviceEventSource;
use crate::prober::Prober;
use crate::report::{ErrorReport, ErrorReportKind, ErrorReportRef};
use crate::task::{RestartPolicy, SingleInstanceTask, TaskResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeStatus {
    Probing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeScope {
    Full,
    Restricted,
}

impl ProbeScope {
    const ORDER: [ProbeScope; 2] = [ProbeScope::Full, ProbeScope::Restricted];

    pub fn label(self) -> &'static str {
        match self {
            ProbeScope::Full => "block",
            ProbeScope::Restricted => "disk",
        }
    }

    pub fn report_kind(self) -> ErrorReportKind {
        match self {
            ProbeScope::Full => ErrorReportKind::BlockProbeFail,
            ProbeScope::Restricted => ErrorReportKind::DiskProbeFail,
        }
    }

    fn kinds(self, use_os_prober: bool) -> BTreeSet<ProbeKind> {
        match self {
            ProbeScope::Full => full_kinds(use_os_prober),
            ProbeScope::Restricted => restricted_kinds(),
        }
    }
}

/// Snapshot of the controller for API clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub status: ProbeStatus,
    pub scopes: BTreeMap<ProbeScope, ProbeStatus>,
    pub errors: Vec<ErrorReportRef>,
    /// Probe results merged into the model so far.
    pub loads: u64,
    pub locked: bool,
    pub configured: bool,
}

struct ControllerState {
    status: ProbeStatus,
    scopes: BTreeMap<ProbeScope, ProbeStatus>,
    errors: Vec<ErrorReport>,
    loads: u64,
    model: Option<StorageModel>,
    last_data: Option<ProbeData>,
    pending: Option<ProbeData>,
    locked: bool,
    configured: bool,
}

struct Shared {
    config: ServiceConfig,
    bootloader: Bootloader,
    prober: Arc<dyn Prober>,
    state: Mutex<ControllerState>,
    probe_task: SingleInstanceTask<()>,
    probe_once_task: SingleInstanceTask<()>,
    listener: SingleInstanceTask<()>,
}

#[derive(Clone)]
pub struct ProbeController {
    shared: Arc<Shared>,
}

impl ProbeController {
    pub fn new(config: ServiceConfig, prober: Arc<dyn Prober>) -> Self {
        let bootloader = config.bootloader();
        Self {
            shared: Arc::new(Shared {
                config,
                bootloader,
                prober,
                state: Mutex::new(ControllerState {
                    status: ProbeStatus::Probing,
                    scopes: BTreeMap::new(),
                    errors: Vec::new(),
                    loads: 0,
                    model: None,
                    last_data: None,
                    pending: None,
                    locked: false,
                    configured: false,
                }),
                probe_task: SingleInstanceTask::new("probe", RestartPolicy::RejectWhileRunning),
                probe_once_task: SingleInstanceTask::new("probe-once", RestartPolicy::CancelRestart),
                listener: SingleInstanceTask::new("device-events", RestartPolicy::CancelRestart),
            }),
        }
    }

    pub fn bootloader(&self) -> Bootloader {
        self.shared.bootloader
    }

    /// Start listening for device events (when given a source) and kick
    /// off the first probe.
    pub fn start(&self, events: Option<Box<dyn DeviceEventSource>>) -> TaskResult<()> {
        if let Some(events) = events {
            let shared = Arc::clone(&self.shared);
            self.shared
                .listener
                .start(move |_| listen(shared, events))?;
        }
        self.trigger_probe()
    }

    /// Start a probe cycle unless one is already running.
    pub fn trigger_probe(&self) -> TaskResult<()> {
        self.shared.trigger_probe()
    }

    pub async fn wait_for_probe(&self) -> TaskResult<()> {
        self.shared.probe_task.wait().await
    }

    /// Probe one scope, replacing any attempt still in flight.
    pub async fn probe_scope(&self, scope: ProbeScope) -> TaskResult<()> {
        self.shared.probe_scope(scope).await
    }

    pub fn stop(&self) -> TaskResult<()> {
        self.shared.listener.cancel()?;
        self.shared.probe_task.cancel()?;
        self.shared.probe_once_task.cancel()
    }

    pub fn status(&self) -> TaskResult<ProbeOutcome> {
        let state = self.shared.lock_state()?;
        Ok(ProbeOutcome {
            status: state.status,
            scopes: state.scopes.clone(),
            errors: state.errors.iter().map(ErrorReport::reference).collect(),
            loads: state.loads,
            locked: state.locked,
            configured: state.configured,
        })
    }

    pub fn errors(&self) -> TaskResult<Vec<ErrorReport>> {
        Ok(self.shared.lock_state()?.errors.clone())
    }

    /// The current model, `None` until a probe has been merged.
    pub fn model(&self) -> TaskResult<Option<StorageModel>> {
        Ok(self.shared.lock_state()?.model.clone())
    }

    /// Stop probe results from replacing the model until `reset`.
    pub fn lock_for_editing(&self) -> TaskResult<()> {
        self.shared.lock_state()?.locked = true;
        Ok(())
    }

    /// Run `change` against a copy of the model and keep the copy only
    /// if it succeeds. Editing locks the model.
    pub fn edit<R>(
        &self,
        change: impl FnOnce(&mut StorageModel) -> storage_planner_core::Result<R>,
    ) -> anyhow::Result<R> {
        let mut state = self.shared.lock_state()?;
        let mut draft = state
            .model
            .clone()
            .ok_or_else(|| anyhow!("storage has not been probed yet"))?;
        let out = change(&mut draft)?;
        state.model = Some(draft);
        state.locked = true;
        Ok(out)
    }

    /// Throw away edits: load queued probe data if any arrived while
    /// locked, otherwise rebuild from the last probe, then unlock.
    pub fn reset(&self) -> anyhow::Result<()> {
        let mut state = self.shared.lock_state()?;
        let queued = state.pending.take();
        let from_queue = queued.is_some();
        if let Some(data) = queued.or_else(|| state.last_data.clone()) {
            let model = model_from_probe_data(&data, self.shared.bootloader)?;
            state.model = Some(model);
            state.last_data = Some(data);
            if from_queue {
                state.loads += 1;
            }
        }
        state.locked = false;
        info!(from_queue, "storage model reset");
        Ok(())
    }

    /// Later probe results are ignored once storage is configured.
    pub fn mark_configured(&self) -> TaskResult<()> {
        self.shared.lock_state()?.configured = true;
        Ok(())
    }
}

impl Shared {
    fn lock_state(&self) -> TaskResult<MutexGuard<'_, ControllerState>> {
        self.state
            .lock()
            .map_err(|_| ServiceError::LockPoisoned("storage state"))
    }

    fn trigger_probe(self: &Arc<Self>) -> TaskResult<()> {
        let shared = Arc::clone(self);
        self.probe_task
            .start(move |_| async move { shared.run_probe().await })
    }

    async fn run_probe(self: &Arc<Self>) -> TaskResult<()> {
        self.begin_cycle()?;
        for scope in ProbeScope::ORDER {
            self.set_scope(scope, ProbeStatus::Probing)?;
            let started = Instant::now();
            let result = self.probe_scope(scope).await;
            info!(
                "{} probing took {:.1} seconds",
                scope.label(),
                started.elapsed().as_secs_f64()
            );
            match result {
                Ok(()) => {
                    self.set_scope(scope, ProbeStatus::Done)?;
                    self.set_status(ProbeStatus::Done)?;
                    return Ok(());
                }
                Err(err) => {
                    warn!(scope = scope.label(), error = %err, "probing failed");
                    self.record_failure(scope, &err)?;
                }
            }
        }
        self.set_status(ProbeStatus::Failed)?;
        Err(ServiceError::ProbeFailed("every probe kind failed".to_string()))
    }

    async fn probe_scope(self: &Arc<Self>, scope: ProbeScope) -> TaskResult<()> {
        let shared = Arc::clone(self);
        let kinds = scope.kinds(self.config.use_os_prober);
        debug!(scope = scope.label(), ?kinds, "starting probe");
        self.probe_once_task.start(move |_| async move {
            let data = shared
                .prober
                .probe(&kinds)
                .await
                .map_err(|err| ServiceError::ProbeFailed(format!("{err:#}")))?;
            shared.merge(data)
        })?;

        let timeout = self.config.probe_timeout();
        match tokio::time::timeout(timeout, self.probe_once_task.wait()).await {
            Ok(result) => result,
            Err(_) => {
                self.probe_once_task.cancel()?;
                Err(ServiceError::TimedOut(timeout))
            }
        }
    }

    fn merge(&self, data: ProbeData) -> TaskResult<()> {
        let model = model_from_probe_data(&data, self.bootloader)
            .map_err(|err| ServiceError::ProbeFailed(err.to_string()))?;
        let mut state = self.lock_state()?;
        if state.configured {
            info!("storage already configured, ignoring probe data");
            return Ok(());
        }
        if state.locked {
            debug!("model is being edited, queueing probe data");
            state.pending = Some(data);
            return Ok(());
        }
        state.model = Some(model);
        state.last_data = Some(data);
        state.loads += 1;
        info!(loads = state.loads, "loaded probe data");
        Ok(())
    }

    fn begin_cycle(&self) -> TaskResult<()> {
        let mut state = self.lock_state()?;
        state.status = ProbeStatus::Probing;
        state.scopes.clear();
        Ok(())
    }

    fn set_scope(&self, scope: ProbeScope, status: ProbeStatus) -> TaskResult<()> {
        self.lock_state()?.scopes.insert(scope, status);
        Ok(())
    }

    fn set_status(&self, status: ProbeStatus) -> TaskResult<()> {
        self.lock_state()?.status = status;
        Ok(())
    }

    fn record_failure(&self, scope: ProbeScope, err: &ServiceError) -> TaskResult<()> {
        let report = ErrorReport::new(scope.report_kind(), err.to_string());
        let mut state = self.lock_state()?;
        state.scopes.insert(scope, ProbeStatus::Failed);
        state.errors.push(report);
        Ok(())
    }
}

/// Turn bursts of device events into single probe runs: wait for the
/// device manager to settle, drop whatever queued up meanwhile, then
/// probe once.
async fn listen(shared: Arc<Shared>, mut events: Box<dyn DeviceEventSource>) -> TaskResult<()> {
    while let Some(event) = events.recv().await {
        debug!(action = %event.action, device = %event.device, "device event");
        let mut attempts = 0;
        while !events.is_settled().await {
            attempts += 1;
            if attempts >= shared.config.settle_max_attempts {
                warn!(attempts, "device events did not settle, probing anyway");
                break;
            }
            tokio::time::sleep(shared.config.settle_delay()).await;
        }
        let mut drained = 0usize;
        while events.try_recv().is_some() {
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "dropped queued device events");
        }
        match shared.trigger_probe() {
            Ok(()) => debug!("probing after device event"),
            Err(ServiceError::AlreadyRunning) => {
                debug!("skipping probe run, one is already active")
            }
            Err(err) => return Err(err),
        }
    }
    debug!("device event source closed");
    Ok(())
}
