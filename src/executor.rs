//! Scan orchestration: lifecycle, routing, output accumulation and persistence.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::builtin;
use crate::config::{Config, ToolOverride};
use crate::error::{ProbeError, RunError, ScanError, SpecError};
use crate::hub::Publisher;
use crate::parsers;
use crate::runner;
use crate::specs::{BuiltinProbe, ExternalTool, ToolKind};
use crate::store::ScanStore;
use crate::types::{Finding, LiveEvent, NewScan, OutputLine, Scan, ScanId, ScanStatus};

const CANCELLED_LINE: &str = "Scan cancelled";

/// Starts scans as independent tasks and tracks them until they finish.
///
/// Cloning is cheap; clones share the same registry and task set.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ScanStore>,
    publisher: Arc<dyn Publisher>,
    /// Cancellation handles of scans whose task has not exited yet.
    registry: DashMap<ScanId, CancellationToken>,
    tracker: TaskTracker,
    /// Parent of every scan token; cancelled on shutdown.
    root: CancellationToken,
    permits: Option<Arc<Semaphore>>,
    overrides: HashMap<String, ToolOverride>,
    output_buffer: usize,
}

/// The scan was cancelled before it got a run slot.
struct CancelledWhileQueued;

impl Executor {
    pub fn new(store: Arc<dyn ScanStore>, publisher: Arc<dyn Publisher>, config: &Config) -> Self {
        let permits = config
            .executor
            .max_concurrent_scans
            .map(|n| Arc::new(Semaphore::new(n)));
        Self {
            inner: Arc::new(Inner {
                store,
                publisher,
                registry: DashMap::new(),
                tracker: TaskTracker::new(),
                root: CancellationToken::new(),
                permits,
                overrides: config.tools.clone(),
                output_buffer: config.executor.output_buffer.max(1),
            }),
        }
    }

    /// Persist `new` as `pending` and schedule it. Returns without waiting for the scan.
    pub async fn start(&self, new: NewScan) -> Result<Scan, ScanError> {
        if new.target.trim().is_empty() {
            return Err(ScanError::Validation("target is required".into()));
        }
        if new.tool.trim().is_empty() {
            return Err(ScanError::Validation("tool is required".into()));
        }

        let scan = self.inner.store.create_scan(&new).await?;
        let cancel = self.inner.root.child_token();
        // Registered before the task exists so an immediate cancel is never lost.
        self.inner.registry.insert(scan.id, cancel.clone());

        tracing::info!(scan_id = scan.id, tool = %scan.tool, target = %scan.target, "scan accepted");

        let inner = Arc::clone(&self.inner);
        let task_scan = scan.clone();
        self.inner
            .tracker
            .spawn(async move { execute(inner, task_scan, cancel).await });

        Ok(scan)
    }

    /// Signal cancellation. Unknown or finished scans are ignored.
    pub fn cancel(&self, id: ScanId) {
        match self.inner.registry.get(&id) {
            Some(token) => {
                tracing::info!(scan_id = id, "cancelling scan");
                token.cancel();
            }
            None => tracing::debug!(scan_id = id, "cancel for inactive scan ignored"),
        }
    }

    pub fn is_active(&self, id: ScanId) -> bool {
        self.inner.registry.contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Cancel every in-flight scan and wait for all tasks to finish.
    pub async fn shutdown(&self) {
        tracing::info!(active = self.active_count(), "executor shutting down");
        self.inner.root.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

/// Removes the registry entry when the task exits, panics included.
struct RegistryGuard {
    inner: Arc<Inner>,
    id: ScanId,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.inner.registry.remove(&self.id);
    }
}

async fn execute(inner: Arc<Inner>, scan: Scan, cancel: CancellationToken) {
    let _guard = RegistryGuard {
        inner: Arc::clone(&inner),
        id: scan.id,
    };
    let mut run = ScanRun {
        inner: Arc::clone(&inner),
        id: scan.id,
        raw: String::new(),
    };

    let status = match AssertUnwindSafe(run.drive(&scan, &cancel))
        .catch_unwind()
        .await
    {
        Ok(status) => status,
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            tracing::error!(scan_id = scan.id, tool = %scan.tool, panic = %msg, "scan task panicked");
            run.emit(OutputLine::stderr(format!("Error: internal error: {msg}")));
            run.finish(&[], ScanStatus::Failed).await
        }
    };

    tracing::info!(scan_id = scan.id, tool = %scan.tool, status = %status, "scan finished");
    // Everything is persisted by now; this is the only done event for the scan.
    inner.publisher.publish(scan.id, LiveEvent::done(status));
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// State of one scan task: every line published is also kept for `raw_output`.
struct ScanRun {
    inner: Arc<Inner>,
    id: ScanId,
    raw: String,
}

impl ScanRun {
    async fn drive(&mut self, scan: &Scan, cancel: &CancellationToken) -> ScanStatus {
        match ToolKind::resolve(&scan.tool) {
            Some(ToolKind::External(tool)) => self.run_external(tool, scan, cancel).await,
            Some(ToolKind::Builtin(probe)) => self.run_builtin(probe, scan, cancel).await,
            None => {
                let e = SpecError::UnknownTool(scan.tool.clone());
                tracing::warn!(scan_id = self.id, tool = %scan.tool, error = %e, "tool spec rejected");
                self.emit(OutputLine::stderr(format!("Error: {e}")));
                self.finish(&[], ScanStatus::Failed).await
            }
        }
    }

    async fn run_external(
        &mut self,
        tool: ExternalTool,
        scan: &Scan,
        cancel: &CancellationToken,
    ) -> ScanStatus {
        let spec = match tool.build_spec(&scan.target, &scan.parameters) {
            Ok(spec) => match self.inner.overrides.get(tool.name()) {
                Some(o) => spec.with_override(o),
                None => spec,
            },
            Err(e) => {
                tracing::warn!(scan_id = self.id, tool = tool.name(), error = %e, "tool spec rejected");
                self.emit(OutputLine::stderr(format!("Error: {e}")));
                return self.finish(&[], ScanStatus::Failed).await;
            }
        };

        let _permit = match self.admit(cancel).await {
            Ok(p) => p,
            Err(CancelledWhileQueued) => {
                self.emit(OutputLine::stderr(CANCELLED_LINE));
                return self.finish(&[], ScanStatus::Failed).await;
            }
        };
        self.mark(ScanStatus::Running).await;

        let (tx, mut rx) = mpsc::channel(self.inner.output_buffer);
        let (outcome, ()) = tokio::join!(runner::run(&spec, cancel.clone(), tx), async {
            while let Some(line) = rx.recv().await {
                self.emit(line);
            }
        });

        tracing::debug!(
            scan_id = self.id,
            tool = tool.name(),
            exit_code = ?outcome.exit_code,
            duration_ms = outcome.duration.as_millis() as u64,
            "tool exited"
        );

        match outcome.error {
            Some(RunError::Cancelled) => {
                self.emit(OutputLine::stderr(CANCELLED_LINE));
                self.finish(&[], ScanStatus::Failed).await
            }
            Some(e) => {
                self.emit(OutputLine::stderr(format!("Error: {e}")));
                self.finish(&[], ScanStatus::Failed).await
            }
            None => {
                let findings = parsers::parse(tool, &outcome.stdout);
                self.finish(&findings, ScanStatus::Completed).await
            }
        }
    }

    async fn run_builtin(
        &mut self,
        probe: BuiltinProbe,
        scan: &Scan,
        cancel: &CancellationToken,
    ) -> ScanStatus {
        let _permit = match self.admit(cancel).await {
            Ok(p) => p,
            Err(CancelledWhileQueued) => {
                self.emit(OutputLine::stderr(CANCELLED_LINE));
                return self.finish(&[], ScanStatus::Failed).await;
            }
        };
        self.mark(ScanStatus::Running).await;

        match builtin::run_probe(probe, &scan.target, cancel).await {
            Ok(report) => {
                for note in report.notes {
                    self.emit(OutputLine::stdout(note));
                }
                for f in &report.findings {
                    self.emit(OutputLine::stdout(format!("{}: {}", f.key, f.value)));
                }
                self.finish(&report.findings, ScanStatus::Completed).await
            }
            Err(ProbeError::Cancelled) => {
                self.emit(OutputLine::stderr(CANCELLED_LINE));
                self.finish(&[], ScanStatus::Failed).await
            }
            Err(e) => {
                tracing::info!(scan_id = self.id, probe = probe.name(), error = %e, "probe failed");
                self.emit(OutputLine::stderr(format!("Error: {e}")));
                self.finish(&[], ScanStatus::Failed).await
            }
        }
    }

    /// Wait for a run slot when concurrency is bounded.
    async fn admit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>, CancelledWhileQueued> {
        let Some(permits) = &self.inner.permits else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CancelledWhileQueued),
            permit = Arc::clone(permits).acquire_owned() => {
                permit.map(Some).map_err(|_| CancelledWhileQueued)
            }
        }
    }

    fn emit(&mut self, line: OutputLine) {
        self.raw.push_str(&line.line);
        self.raw.push('\n');
        self.inner.publisher.publish(self.id, line.into());
    }

    async fn mark(&self, status: ScanStatus) {
        if let Err(e) = self.inner.store.update_status(self.id, status).await {
            tracing::error!(scan_id = self.id, status = %status, error = %e, "failed to persist scan status");
        }
    }

    /// Persist raw output, then findings, then the terminal status.
    async fn finish(&mut self, findings: &[Finding], status: ScanStatus) -> ScanStatus {
        let store = &self.inner.store;
        if let Err(e) = store.update_raw_output(self.id, &self.raw).await {
            tracing::error!(scan_id = self.id, error = %e, "failed to persist raw output");
        }
        if !findings.is_empty() {
            if let Err(e) = store.insert_results(self.id, findings).await {
                tracing::error!(scan_id = self.id, error = %e, "failed to store results");
            }
        }
        self.mark(status).await;
        status
    }
}
