//! Sync cycle state machine.
//!
//! `IDLE -> RECONCILE -> DOWNLOAD -> EXECUTE -> UPLOAD -> {SUCCESS | RETRY | FAILURE}`
//!
//! Reconcile runs only while nothing is waiting to be applied. Upload runs
//! only once everything is applied. A transport failure ends the cycle in
//! `FAILURE`; queues are left exactly as the last committed step left them.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::{Mutex, watch};

use crate::observability::MetricsRegistry;
use crate::store::Store;
use crate::sync::SyncError;
use crate::sync::execute_agent::{ExecuteAgent, ExecuteReport};
use crate::sync::reconcile::{NativeSource, ReconcileReport, Reconciler};
use crate::sync::transport::{DownloadReport, Transport, UploadReport};

/// Longest pause `run_periodic` takes after repeated failures.
const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
	Idle,
	Reconcile,
	Download,
	Execute,
	Upload,
}

impl std::fmt::Display for SyncPhase {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			SyncPhase::Idle => "idle",
			SyncPhase::Reconcile => "reconcile",
			SyncPhase::Download => "download",
			SyncPhase::Execute => "execute",
			SyncPhase::Upload => "upload",
		};
		f.write_str(name)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
	/// Changes still failed to apply, so nothing was uploaded
	ExecuteQueueNotEmpty { remaining: i64 },
	/// Local changes are still waiting for acknowledgment
	UploadQueueNotEmpty { remaining: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
	Success,
	Retry(RetryReason),
	Failure { phase: SyncPhase, error: String },
}

/// What one cycle did. Phases that did not run are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
	pub outcome: CycleOutcome,
	pub reconciled: Option<ReconcileReport>,
	pub downloaded: Option<DownloadReport>,
	pub executed: Option<ExecuteReport>,
	pub uploaded: Option<UploadReport>,
	pub duration: Duration,
}

/// State published to an external scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
	/// No cycle has run yet
	Unset,
	Running { phase: SyncPhase },
	Succeeded,
	/// The last cycle did not finish; `retry` asks for a prompt rerun rather
	/// than a backoff
	Failed { retry: bool },
}

pub struct SyncOrchestrator {
	store: Arc<Store>,
	execute_agent: Arc<ExecuteAgent>,
	transport: Transport,
	native: Option<(Reconciler, Arc<dyn NativeSource>)>,
	metrics: Arc<MetricsRegistry>,
	state: watch::Sender<SchedulerState>,
	cycle: Mutex<()>,
}

impl SyncOrchestrator {
	pub fn new(
		store: Arc<Store>,
		execute_agent: Arc<ExecuteAgent>,
		transport: Transport,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		let (state, _) = watch::channel(SchedulerState::Unset);
		Self {
			store,
			execute_agent,
			transport,
			native: None,
			metrics,
			state,
			cycle: Mutex::new(()),
		}
	}

	/// Reconcile `source` at the start of every cycle.
	pub fn with_native_source(mut self, reconciler: Reconciler, source: Arc<dyn NativeSource>) -> Self {
		self.native = Some((reconciler, source));
		self
	}

	pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
		self.state.subscribe()
	}

	pub fn state(&self) -> SchedulerState {
		*self.state.borrow()
	}

	fn enter(&self, phase: SyncPhase) {
		self.state.send_replace(SchedulerState::Running { phase });
	}

	/// Run one cycle. Concurrent callers are serialized.
	#[tracing::instrument(skip(self))]
	pub async fn run_cycle(&self) -> CycleReport {
		let _cycle = self.cycle.lock().await;
		let started = Instant::now();
		self.metrics.sync_cycles_total.inc();

		let mut report = CycleReport {
			outcome: CycleOutcome::Success,
			reconciled: None,
			downloaded: None,
			executed: None,
			uploaded: None,
			duration: Duration::ZERO,
		};
		report.outcome = self.phases(&mut report).await;
		report.duration = started.elapsed();
		self.metrics
			.sync_cycle_duration_seconds
			.observe(report.duration.as_secs_f64());

		let state = match &report.outcome {
			CycleOutcome::Success => {
				info!("sync cycle succeeded in {:?}", report.duration);
				SchedulerState::Succeeded
			}
			CycleOutcome::Retry(reason) => {
				self.metrics.sync_cycle_retries_total.inc();
				info!("sync cycle needs a retry: {:?}", reason);
				SchedulerState::Failed { retry: true }
			}
			CycleOutcome::Failure { phase, error } => {
				self.metrics.sync_cycle_failures_total.inc();
				warn!("sync cycle failed during {}: {}", phase, error);
				SchedulerState::Failed { retry: false }
			}
		};
		self.state.send_replace(state);
		report
	}

	async fn phases(&self, report: &mut CycleReport) -> CycleOutcome {
		let fail = |phase: SyncPhase, error: SyncError| CycleOutcome::Failure {
			phase,
			error: error.to_string(),
		};

		if let Some((reconciler, source)) = &self.native {
			self.enter(SyncPhase::Reconcile);
			let pending = match self.store.queue_depths().await {
				Ok(depths) => depths.execute_queue,
				Err(e) => return fail(SyncPhase::Reconcile, e.into()),
			};
			if pending == 0 {
				match reconciler.reconcile(source.as_ref()).await {
					Ok(r) => report.reconciled = Some(r),
					// A provider hiccup only delays local edits to the next cycle.
					Err(SyncError::Native(e)) => warn!("native reconcile skipped: {}", e),
					Err(e) => return fail(SyncPhase::Reconcile, e),
				}
			}
		}

		self.enter(SyncPhase::Download);
		match self.transport.download().await {
			Ok(r) => report.downloaded = Some(r),
			Err(e) => return fail(SyncPhase::Download, e),
		}

		self.enter(SyncPhase::Execute);
		match self.execute_agent.execute_all().await {
			Ok(r) => report.executed = Some(r),
			Err(e) => return fail(SyncPhase::Execute, e.into()),
		}
		match self.store.queue_depths().await {
			Ok(d) if d.execute_queue > 0 => {
				return CycleOutcome::Retry(RetryReason::ExecuteQueueNotEmpty {
					remaining: d.execute_queue,
				});
			}
			Ok(_) => {}
			Err(e) => return fail(SyncPhase::Execute, e.into()),
		}

		self.enter(SyncPhase::Upload);
		match self.transport.upload().await {
			Ok(r) => report.uploaded = Some(r),
			Err(e) => return fail(SyncPhase::Upload, e),
		}
		match self.store.queue_depths().await {
			Ok(d) if d.upload_queue > 0 => CycleOutcome::Retry(RetryReason::UploadQueueNotEmpty {
				remaining: d.upload_queue,
			}),
			Ok(_) => CycleOutcome::Success,
			Err(e) => fail(SyncPhase::Upload, e.into()),
		}
	}

	/// Run cycles every `interval` until `shutdown` resolves, backing off
	/// after consecutive failures.
	pub async fn run_periodic<F>(&self, interval: Duration, shutdown: F)
	where
		F: Future<Output = ()>,
	{
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		tokio::pin!(shutdown);
		let mut failures: u32 = 0;

		loop {
			tokio::select! {
				biased;
				_ = &mut shutdown => break,
				_ = ticker.tick() => {}
			}

			let report = self.run_cycle().await;
			if !matches!(report.outcome, CycleOutcome::Failure { .. }) {
				failures = 0;
				continue;
			}

			failures += 1;
			let backoff = interval.saturating_mul(1 << failures.min(6)).min(MAX_BACKOFF);
			info!("backing off {:?} after {} consecutive failure(s)", backoff, failures);
			tokio::select! {
				biased;
				_ = &mut shutdown => break,
				_ = tokio::time::sleep(backoff) => {}
			}
		}
		info!("periodic sync stopped");
	}
}
