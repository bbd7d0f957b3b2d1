use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::ForemanConfig;
use crate::domain::{ContextItem, Epoch, Mission, Reflection, StopReason, UnitState, WorkUnit};
use crate::error::{ForemanError, Result};
use crate::git::GitRunner;
use crate::limits::{BreakerOutcome, CircuitBreakerSet, EmaBudget, WorkerPermits};
use crate::merge::{GreenBranchManager, MergeOutcome, MergeQueue, MergeSubmission};
use crate::planner::{
    PlanContext, Planner, overlap_ratio, partition_layer_by_overlap, topo_layers,
};
use crate::review::DiffReviewer;
use crate::store::Store;
use crate::worker::{ResultEnvelope, WorkerBackend, WorkerRequest, render_worker_prompt};
use crate::workspace::{WorkspaceHandle, WorkspacePool};

const WORKER_COMPONENT: &str = "worker";

/// Final snapshot of a finished mission.
#[derive(Debug, Clone)]
pub struct MissionOutcome {
    pub mission_id: String,
    pub stop_reason: StopReason,
    pub total_cost_usd: f64,
    pub epochs: u32,
    pub completed_units: u32,
    pub failed_units: u32,
}

impl MissionOutcome {
    pub fn made_progress(&self) -> bool {
        self.completed_units > 0
    }

    pub fn exit_code(&self) -> u8 {
        self.stop_reason.exit_code(self.made_progress())
    }
}

#[derive(Debug, Default, Clone)]
pub struct EpochSummary {
    pub planned: usize,
    pub dispatched: usize,
    pub completed: u32,
    pub failed: u32,
    pub cost_usd: f64,
}

struct WorkerTaskResult {
    unit: WorkUnit,
    handle: Option<WorkspaceHandle>,
    envelope: Option<ResultEnvelope>,
    submitted: bool,
    failure: Option<String>,
}

/// The mission driver: one logical writer looping plan -> ambition gate ->
/// topological dispatch -> merge-queue drain -> feedback -> stop checks.
pub struct ContinuousController {
    config: ForemanConfig,
    store: Store,
    pool: Arc<WorkspacePool>,
    backend: Arc<dyn WorkerBackend>,
    planner: Arc<dyn Planner>,
    green: Arc<GreenBranchManager>,
    reviewer: Arc<DiffReviewer>,
    queue: Arc<MergeQueue>,
    permits: WorkerPermits,
    breakers: Arc<CircuitBreakerSet>,
    budget: parking_lot::Mutex<EmaBudget>,
    running: AtomicBool,
    started: Instant,
    /// (mission-relative ms, path) for every file merged so far; drives
    /// the backlog staleness overlap rule.
    merged_files: parking_lot::Mutex<Vec<(u64, String)>>,
    /// Stale-unit descriptions pending inclusion in the next plan context.
    stale_context: parking_lot::Mutex<Vec<String>>,
    changelog_path: PathBuf,
}

impl ContinuousController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ForemanConfig,
        store: Store,
        pool: Arc<WorkspacePool>,
        backend: Arc<dyn WorkerBackend>,
        planner: Arc<dyn Planner>,
        green: Arc<GreenBranchManager>,
        reviewer: Arc<DiffReviewer>,
        breakers: Arc<CircuitBreakerSet>,
    ) -> Self {
        let permits = WorkerPermits::new(config.scheduler.parallel.num_workers);
        let changelog_path = config.target.state_dir().join("changelog.log");
        Self {
            config,
            store,
            pool,
            backend,
            planner,
            green,
            reviewer,
            queue: Arc::new(MergeQueue::new()),
            permits,
            breakers,
            budget: parking_lot::Mutex::new(EmaBudget::new()),
            running: AtomicBool::new(true),
            started: Instant::now(),
            merged_files: parking_lot::Mutex::new(Vec::new()),
            stale_context: parking_lot::Mutex::new(Vec::new()),
            changelog_path,
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Live worker-concurrency adjustment; dispatch always reads the
    /// resized cell, never a captured copy.
    pub fn resize_workers(&self, num_workers: usize) {
        self.permits.resize(num_workers);
    }

    pub fn worker_capacity(&self) -> usize {
        self.permits.capacity()
    }

    /// Drive a mission to a terminal state.
    pub async fn run(&self, objective: &str) -> Result<MissionOutcome> {
        let continuous = &self.config.continuous;
        let mut mission = Mission::new(objective, &self.config.target.verification.command)
            .with_budget(
                self.config.scheduler.budget.max_per_run_usd,
                continuous.max_wall_time_seconds,
            );
        self.store.upsert_mission(&mission).await?;
        info!(mission_id = %mission.id, objective, "Mission started");

        self.green.initialize().await?;

        let mut completed_units = 0u32;
        let mut failed_units = 0u32;
        let mut consecutive_all_fail = 0u32;
        let mut stall_count = 0u32;
        let mut stop_reason: Option<StopReason> = None;

        // Every fallible call inside the loop is classified rather than
        // propagated, so the post-loop flush/changelog/cleanup always runs.
        let mut last_green = match self.green.green_hash().await {
            Ok(hash) => hash,
            Err(e) if e.is_integrity() => {
                error!(error = %e, "Cannot read mc/green after init, stopping mission");
                stop_reason = Some(StopReason::InternalError);
                String::new()
            }
            Err(e) => {
                warn!(error = %e, "Could not read initial mc/green hash");
                String::new()
            }
        };

        for ordinal in 1..=self.config.rounds.max_rounds {
            if stop_reason.is_some() {
                break;
            }
            if !self.running.load(Ordering::SeqCst) {
                stop_reason = Some(StopReason::Cancelled);
                break;
            }
            if self.started.elapsed().as_secs() >= mission.wall_time_budget_secs {
                stop_reason = Some(StopReason::TimeBudget);
                break;
            }
            if mission.budget_usd > 0.0 && mission.total_cost_usd >= mission.budget_usd {
                stop_reason = Some(StopReason::CostBudget);
                break;
            }

            let summary = match self.run_epoch(&mission, ordinal).await {
                Ok(summary) => summary,
                Err(e) if e.is_integrity() => {
                    error!(error = %e, "Integrity failure, stopping mission");
                    stop_reason = Some(StopReason::InternalError);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, ordinal, "Epoch failed, moving on");
                    self.changelog(&mission.id, "epoch_error", &e.to_string(), "-")
                        .await;
                    continue;
                }
            };

            mission.total_epochs = ordinal;
            mission.total_cost_usd += summary.cost_usd;
            completed_units += summary.completed;
            failed_units += summary.failed;
            if let Err(e) = self.store.upsert_mission(&mission).await {
                if e.is_integrity() {
                    error!(error = %e, "Failed to persist mission, stopping");
                    stop_reason = Some(StopReason::InternalError);
                    break;
                }
                warn!(error = %e, "Failed to persist mission progress");
            }

            if !continuous.objective_command.is_empty() {
                let (met, _) = crate::merge::run_objective_probe(
                    self.green.workspace(),
                    &continuous.objective_command,
                    Duration::from_secs(self.config.target.verification.timeout_secs),
                )
                .await;
                if met {
                    stop_reason = Some(StopReason::ObjectiveMet);
                    break;
                }
            }

            // Total failure handling: back off once, stop when it repeats.
            if summary.dispatched > 0 && summary.completed == 0 {
                consecutive_all_fail += 1;
                if consecutive_all_fail >= continuous.max_consecutive_failures {
                    stop_reason = Some(StopReason::RepeatedTotalFailure);
                    break;
                }
                info!(
                    consecutive_all_fail,
                    backoff_secs = continuous.failure_backoff_seconds,
                    "Epoch failed completely, backing off"
                );
                tokio::time::sleep(Duration::from_secs(continuous.failure_backoff_seconds)).await;
            } else {
                consecutive_all_fail = 0;
            }

            // Stall detection on mc/green advancement. A one-off read
            // failure skips the check; the next epoch re-reads.
            match self.green.green_hash().await {
                Ok(green_now) => {
                    if green_now == last_green {
                        stall_count += 1;
                        if stall_count >= self.config.rounds.stall_threshold {
                            stop_reason = Some(StopReason::Stalled);
                            break;
                        }
                    } else {
                        stall_count = 0;
                        last_green = green_now;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Could not read mc/green for stall check");
                }
            }

            // Adaptive cooldown: stretch it when the cost projection says
            // the budget is at risk.
            let mut cooldown = continuous.cooldown_seconds;
            let remaining_estimate = self.config.continuous.max_units_per_epoch
                * (self.config.rounds.max_rounds - ordinal) as usize;
            if self.budget.lock().should_slow_down(
                mission.total_cost_usd,
                mission.budget_usd,
                remaining_estimate,
            ) {
                cooldown *= 4;
                debug!(cooldown, "Budget pressure, stretched cooldown");
            }
            if cooldown > 0 {
                tokio::time::sleep(Duration::from_secs(cooldown)).await;
            }
        }

        let reason = stop_reason.unwrap_or(StopReason::MaxRounds);

        // Flush any promotions still batched below push_batch_size.
        if let Err(e) = self.green.maybe_push(true).await {
            warn!(error = %e, "Final push flush failed");
        }

        mission.stop(reason);
        if let Err(e) = self.store.upsert_mission(&mission).await {
            error!(error = %e, "Failed to persist terminal mission state");
        }
        self.changelog(
            &mission.id,
            "mission_stopped",
            &format!(
                "reason={} cost=${:.2} completed={} failed={}",
                reason, mission.total_cost_usd, completed_units, failed_units
            ),
            "-",
        )
        .await;
        let _ = self.backend.cleanup().await;
        info!(mission_id = %mission.id, reason = %reason, "Mission stopped");

        Ok(MissionOutcome {
            mission_id: mission.id,
            stop_reason: reason,
            total_cost_usd: mission.total_cost_usd,
            epochs: mission.total_epochs,
            completed_units,
            failed_units,
        })
    }

    async fn run_epoch(&self, mission: &Mission, ordinal: u32) -> Result<EpochSummary> {
        let mut epoch = Epoch::new(&mission.id, ordinal);
        self.store.upsert_epoch(&epoch).await?;

        let (mut units, score) = self.plan_with_gates(mission, &epoch).await?;
        epoch.ambition_score = score;

        units = self.drop_stale_units(&mission.id, units).await;
        for unit in &mut units {
            unit.epoch_id = epoch.id.clone();
            if unit.queued_at_monotonic_ms == 0 {
                unit.queued_at_monotonic_ms = self.started.elapsed().as_millis() as u64;
            }
            self.store.upsert_unit(unit).await?;
        }
        epoch.planned_unit_ids = units.iter().map(|u| u.id.clone()).collect();
        self.store.upsert_epoch(&epoch).await?;

        let mut summary = EpochSummary {
            planned: units.len(),
            ..Default::default()
        };

        if units.is_empty() {
            epoch.ended_at = Some(Utc::now());
            self.store.upsert_epoch(&epoch).await?;
            return Ok(summary);
        }

        // Layer order from the dependency DAG, overlap exclusion within
        // each layer; deferred units slide into the following layer.
        let layers = topo_layers(&units)?;
        let mut unit_map: HashMap<String, WorkUnit> =
            units.into_iter().map(|u| (u.id.clone(), u)).collect();
        let mut layer_queue: VecDeque<Vec<WorkUnit>> = layers
            .into_iter()
            .map(|ids| {
                ids.into_iter()
                    .filter_map(|id| unit_map.remove(&id))
                    .collect()
            })
            .collect();

        let mut failed_ids: HashSet<String> = HashSet::new();

        while let Some(layer_units) = layer_queue.pop_front() {
            if layer_units.is_empty() {
                continue;
            }
            let (dispatch_now, deferred) = partition_layer_by_overlap(layer_units);
            if !deferred.is_empty() {
                debug!(count = deferred.len(), "Deferred overlapping units to next layer");
                if let Some(next) = layer_queue.front_mut() {
                    next.splice(0..0, deferred);
                } else {
                    layer_queue.push_back(deferred);
                }
            }

            let mut dispatchable = Vec::new();
            for mut unit in dispatch_now {
                let failed_dep = unit
                    .depends_on
                    .iter()
                    .find(|d| failed_ids.contains(*d))
                    .cloned();
                if let Some(dep) = failed_dep {
                    unit.transition_to(UnitState::Rejected)?;
                    unit.last_failure_reason = format!("dependency failed: {}", dep);
                    self.store.upsert_unit(&unit).await?;
                    self.changelog(&unit.id, "dependency_failed", &unit.last_failure_reason, "-")
                        .await;
                    failed_ids.insert(unit.id.clone());
                    summary.failed += 1;
                    continue;
                }
                dispatchable.push(unit);
            }

            // Waves bounded by free pool slots and the live worker cap:
            // every dispatched unit keeps its clone until its merge
            // resolves, so a wave must never outnumber the free clones.
            let mut dispatchable: VecDeque<WorkUnit> = dispatchable.into();
            while !dispatchable.is_empty() {
                let slots = self
                    .pool
                    .available_slots()
                    .await
                    .min(self.permits.capacity())
                    .max(1);
                let wave: Vec<WorkUnit> = dispatchable
                    .drain(..slots.min(dispatchable.len()))
                    .collect();
                self.run_wave(mission, &mut epoch, wave, &mut failed_ids, &mut summary)
                    .await?;
            }
        }

        epoch.all_failed = summary.dispatched > 0 && summary.completed == 0;
        epoch.cost_usd = summary.cost_usd;
        epoch.ended_at = Some(Utc::now());
        self.store.upsert_epoch(&epoch).await?;

        let reflection = Reflection::new(
            &mission.id,
            &epoch.id,
            format!(
                "epoch {}: planned {} dispatched {} completed {} failed {} cost ${:.2} ambition {:.1}",
                ordinal,
                summary.planned,
                summary.dispatched,
                summary.completed,
                summary.failed,
                summary.cost_usd,
                epoch.ambition_score,
            ),
        );
        self.store.insert_reflection(&reflection).await?;

        Ok(summary)
    }

    /// Dispatch one wave, drain its submissions in submission order, and
    /// integrate them one at a time (the single writer to the refs).
    async fn run_wave(
        &self,
        mission: &Mission,
        epoch: &mut Epoch,
        wave: Vec<WorkUnit>,
        failed_ids: &mut HashSet<String>,
        summary: &mut EpochSummary,
    ) -> Result<()> {
        let results = self.dispatch_layer(mission, wave).await;
        summary.dispatched += results.len();
        epoch
            .dispatched_unit_ids
            .extend(results.iter().map(|r| r.unit.id.clone()));

        // Every submission for this wave is already enqueued.
        let expected = results.iter().filter(|r| r.submitted).count();
        let submissions = self.queue.drain(expected, Duration::from_secs(5)).await;

        let mut by_unit: HashMap<String, WorkerTaskResult> = results
            .into_iter()
            .map(|r| (r.unit.id.clone(), r))
            .collect();

        for submission in submissions {
            let Some(result) = by_unit.remove(&submission.unit_id) else {
                warn!(unit_id = %submission.unit_id, "Submission without worker record");
                continue;
            };
            let mut unit = result.unit;
            if let Some(env) = &result.envelope {
                summary.cost_usd += env.cost_usd;
                if env.cost_usd > 0.0 {
                    self.budget.lock().record(env.cost_usd);
                }
            }

            let completed = self.integrate(&mut unit, submission, mission).await?;
            if completed {
                summary.completed += 1;
            } else {
                failed_ids.insert(unit.id.clone());
                summary.failed += 1;
            }

            if let Some(handle) = result.handle {
                let _ = self.pool.release(handle).await;
            }
        }

        // Workers that never reached the merge queue.
        for (_, result) in by_unit {
            let mut unit = result.unit;
            if let Some(env) = &result.envelope {
                summary.cost_usd += env.cost_usd;
                if env.cost_usd > 0.0 {
                    self.budget.lock().record(env.cost_usd);
                }
            }

            if let Some(env) = result
                .envelope
                .as_ref()
                .filter(|env| env.is_success() && env.branch_ref.is_empty())
            {
                // Research-style units legitimately end with no commits;
                // nothing to integrate.
                unit.transition_to(UnitState::Completed)?;
                self.store.upsert_unit(&unit).await?;
                self.record_discoveries(&mission.id, env).await;
                summary.completed += 1;
            } else {
                let reason = result
                    .failure
                    .or(result.envelope.as_ref().map(|e| e.summary.clone()))
                    .unwrap_or_else(|| "worker failed".into());
                unit.transition_to(UnitState::Rejected)?;
                unit.last_failure_reason = crate::merge::clip_failure(&reason);
                self.store.upsert_unit(&unit).await?;
                let workspace = result
                    .handle
                    .as_ref()
                    .map(|h| h.path.display().to_string())
                    .unwrap_or_else(|| "-".into());
                self.changelog(&unit.id, "worker_failed", &unit.last_failure_reason, &workspace)
                    .await;
                failed_ids.insert(unit.id.clone());
                summary.failed += 1;
            }

            if let Some(handle) = result.handle {
                let _ = self.pool.release(handle).await;
            }
        }

        Ok(())
    }

    /// Plan under the ambition gate: request replans for cycles or
    /// under-ambitious plans, then accept the final plan regardless.
    async fn plan_with_gates(
        &self,
        mission: &Mission,
        epoch: &Epoch,
    ) -> Result<(Vec<WorkUnit>, f64)> {
        let continuous = &self.config.continuous;
        let reflections: Vec<String> = self
            .store
            .reflections_for_mission(&mission.id, 5)
            .await?
            .into_iter()
            .map(|r| r.content)
            .collect();
        let stale_context: Vec<String> = self.stale_context.lock().drain(..).collect();

        let mut rejection: Option<String> = None;
        for attempt in 0..=continuous.max_replan_attempts {
            let ctx = PlanContext {
                mission_id: mission.id.clone(),
                epoch_id: epoch.id.clone(),
                epoch_ordinal: epoch.ordinal,
                objective: mission.objective.clone(),
                max_units: continuous.max_units_per_epoch,
                reflections: reflections.clone(),
                stale_context: stale_context.clone(),
                rejection_reason: rejection.clone(),
            };

            let mut units = self.planner.plan_epoch(&ctx).await?;
            units.truncate(continuous.max_units_per_epoch);

            if let Err(e) = topo_layers(&units) {
                warn!(attempt, error = %e, "Plan rejected: dependency cycle");
                rejection = Some(e.to_string());
                continue;
            }

            let score = self.planner.ambition_score(&units);
            if score < continuous.min_ambition_score && attempt < continuous.max_replan_attempts {
                info!(
                    attempt,
                    score,
                    threshold = continuous.min_ambition_score,
                    "Plan below ambition threshold, requesting replan"
                );
                rejection = Some(format!(
                    "ambition score {:.1} below threshold {:.1}",
                    score, continuous.min_ambition_score
                ));
                continue;
            }

            return Ok((units, score));
        }

        // Every replan produced a cyclic graph; run an empty epoch rather
        // than dispatch a broken plan.
        warn!("All replan attempts failed validation, running empty epoch");
        Ok((Vec::new(), 0.0))
    }

    /// Apply the backlog staleness rules, feeding dropped descriptions
    /// into the next plan context.
    async fn drop_stale_units(&self, mission_id: &str, units: Vec<WorkUnit>) -> Vec<WorkUnit> {
        let max_age_ms = self.config.continuous.backlog_max_age_seconds * 1000;
        let now_ms = self.started.elapsed().as_millis() as u64;

        let mut kept = Vec::new();
        for mut unit in units {
            let queued_ms = unit.queued_at_monotonic_ms;
            let aged = queued_ms > 0 && now_ms.saturating_sub(queued_ms) > max_age_ms;

            let overlapped = if queued_ms > 0 && !unit.files_hint.is_empty() {
                let merged: HashSet<String> = self
                    .merged_files
                    .lock()
                    .iter()
                    .filter(|(t, _)| *t >= queued_ms)
                    .map(|(_, f)| f.clone())
                    .collect();
                overlap_ratio(&unit.files_hint, &merged) > 0.5
            } else {
                false
            };

            if aged || overlapped {
                let why = if aged { "aged out" } else { "files overtaken by merges" };
                info!(unit_id = %unit.id, why, "Dropping stale unit");
                if let Err(e) = unit.transition_to(UnitState::Stale) {
                    warn!(unit_id = %unit.id, error = %e, "Stale transition refused");
                } else {
                    let _ = self.store.upsert_unit(&unit).await;
                }
                self.stale_context.lock().push(unit.description.clone());
                let item = ContextItem::new(mission_id, "stale_context", &unit.description);
                let _ = self.store.insert_context_item(&item).await;
            } else {
                kept.push(unit);
            }
        }
        kept
    }

    /// Dispatch one layer's units concurrently, bounded by pool slots and
    /// the live worker permits.
    async fn dispatch_layer(
        &self,
        mission: &Mission,
        units: Vec<WorkUnit>,
    ) -> Vec<WorkerTaskResult> {
        let mut handles = Vec::new();
        for mut unit in units {
            if let Err(e) = unit.transition_to(UnitState::Dispatched) {
                warn!(unit_id = %unit.id, error = %e, "Refusing to dispatch unit");
                continue;
            }
            unit.attempt_count += 1;
            if let Err(e) = self.store.upsert_unit(&unit).await {
                warn!(unit_id = %unit.id, error = %e, "Failed to persist dispatch");
            }

            let objective = mission.objective.clone();
            let green_branch = self.green.green_branch().to_string();
            let permits = self.permits.clone();
            let pool = Arc::clone(&self.pool);
            let backend = Arc::clone(&self.backend);
            let queue = Arc::clone(&self.queue);
            let breakers = Arc::clone(&self.breakers);
            let timeout = Duration::from_secs(self.config.scheduler.session_timeout_secs);

            handles.push(tokio::spawn(run_worker_task(
                unit, objective, green_branch, permits, pool, backend, queue, breakers, timeout,
            )));
        }

        let mut results = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }
        results
    }

    /// Integrate one submission: merge pipeline, fixup escalation, review
    /// dispatch, bookkeeping. Returns true when the unit completed.
    async fn integrate(
        &self,
        unit: &mut WorkUnit,
        submission: MergeSubmission,
        mission: &Mission,
    ) -> Result<bool> {
        let gb = &self.config.green_branch;
        let mut outcome = self
            .green
            .process(&submission, &unit.acceptance_criteria)
            .await;

        loop {
            match outcome {
                MergeOutcome::Completed {
                    merge_commit,
                    changed_files,
                    criteria_passed,
                } => {
                    unit.transition_to(UnitState::Merged)?;
                    self.store.upsert_unit(unit).await?;
                    unit.transition_to(UnitState::Completed)?;
                    self.store.upsert_unit(unit).await?;

                    let now_ms = self.started.elapsed().as_millis() as u64;
                    self.merged_files
                        .lock()
                        .extend(changed_files.iter().map(|f| (now_ms, f.clone())));

                    self.record_discoveries(&mission.id, &submission.envelope).await;

                    let skip_review = criteria_passed && self.config.review.skip_when_criteria_passed;
                    if self.reviewer.enabled() && !skip_review {
                        self.spawn_review(unit.clone(), mission, &merge_commit).await;
                    }
                    return Ok(true);
                }
                MergeOutcome::AlreadyMerged => {
                    unit.transition_to(UnitState::Completed)?;
                    self.store.upsert_unit(unit).await?;
                    return Ok(true);
                }
                MergeOutcome::RolledBack { stage, output } => {
                    unit.transition_to(UnitState::RolledBack)?;
                    unit.last_failure_reason = format!("{}: {}", stage, crate::merge::clip_failure(&output));
                    self.store.upsert_unit(unit).await?;
                    self.changelog(
                        &unit.id,
                        stage,
                        &unit.last_failure_reason,
                        &submission.workspace.display().to_string(),
                    )
                    .await;

                    if unit.attempt_count > gb.fixup_max_attempts {
                        unit.transition_to(UnitState::Rejected)?;
                        self.store.upsert_unit(unit).await?;
                        return Ok(false);
                    }
                    unit.attempt_count += 1;
                    self.store.upsert_unit(unit).await?;

                    let fixup = self
                        .green
                        .run_fixup(
                            unit,
                            &output,
                            &self.pool,
                            self.backend.as_ref(),
                            gb.fixup_candidates,
                            Duration::from_secs(self.config.scheduler.session_timeout_secs),
                        )
                        .await?;

                    let Some(winner) = fixup.winner else {
                        unit.transition_to(UnitState::Rejected)?;
                        unit.last_failure_reason =
                            format!("all {} fixup candidates failed", fixup.candidates.len());
                        self.store.upsert_unit(unit).await?;
                        self.changelog(&unit.id, "fixup_failed", &unit.last_failure_reason, "-")
                            .await;
                        return Ok(false);
                    };

                    let winner_workspace = fixup
                        .winner_workspace
                        .as_ref()
                        .map(|h| h.path.clone())
                        .unwrap_or_else(|| self.green.workspace().to_path_buf());
                    let fixup_submission = MergeSubmission {
                        unit_id: unit.id.clone(),
                        branch_ref: winner.branch.clone(),
                        workspace: winner_workspace,
                        envelope: submission.envelope.clone(),
                        submitted_at: Instant::now(),
                    };
                    // Back to dispatched for the retry attempt.
                    unit.transition_to(UnitState::Dispatched)?;
                    self.store.upsert_unit(unit).await?;
                    outcome = self
                        .green
                        .process(&fixup_submission, &unit.acceptance_criteria)
                        .await;

                    if let Some(handle) = fixup.winner_workspace {
                        let _ = self.pool.release(handle).await;
                    }
                }
                MergeOutcome::Abandoned { reason } => {
                    unit.transition_to(UnitState::Rejected)?;
                    unit.last_failure_reason = crate::merge::clip_failure(&reason);
                    self.store.upsert_unit(unit).await?;
                    self.changelog(
                        &unit.id,
                        "abandoned",
                        &unit.last_failure_reason,
                        &submission.workspace.display().to_string(),
                    )
                    .await;
                    return Ok(false);
                }
            }
        }
    }

    async fn record_discoveries(&self, mission_id: &str, envelope: &ResultEnvelope) {
        for discovery in &envelope.discoveries {
            let item = ContextItem::new(mission_id, "discovery", discovery);
            let _ = self.store.insert_context_item(&item).await;
        }
        for context in &envelope.context_items {
            let item = ContextItem::new(mission_id, "context", context);
            let _ = self.store.insert_context_item(&item).await;
        }
    }

    /// Fire-and-forget diff review; never order-blocks the pipeline.
    async fn spawn_review(&self, unit: WorkUnit, mission: &Mission, merge_commit: &str) {
        let diff = match self.green.diff_for(merge_commit).await {
            Ok(diff) => diff,
            Err(e) => {
                warn!(unit_id = %unit.id, error = %e, "Could not compute diff for review");
                return;
            }
        };

        let reviewer = Arc::clone(&self.reviewer);
        let store = self.store.clone();
        let objective = mission.objective.clone();
        let review_config = self.config.review.clone();
        let mission_id = mission.id.clone();

        tokio::spawn(async move {
            let Some(record) = reviewer.review_unit(&unit, &diff, &objective).await else {
                return;
            };
            let low_score = record.parsed && record.average() < review_config.min_review_score;
            if let Err(e) = store.insert_review(&record).await {
                warn!(unit_id = %unit.id, error = %e, "Failed to store review");
            }
            // Low scores feed re-planning hints; they never unwind merges.
            if review_config.gate_completion && low_score {
                let item = ContextItem::new(
                    &mission_id,
                    "low_review",
                    format!(
                        "unit {} scored {:.1} (alignment {} approach {} tests {})",
                        unit.id, record.average(), record.alignment, record.approach, record.tests
                    ),
                );
                let _ = store.insert_context_item(&item).await;
            }
        });
    }

    /// One line per failure in the mission changelog.
    async fn changelog(&self, id: &str, kind: &str, summary: &str, workspace: &str) {
        let line = format!(
            "{} {} kind={} workspace={} {}\n",
            Utc::now().to_rfc3339(),
            id,
            kind,
            workspace,
            summary.replace('\n', " "),
        );
        if let Some(parent) = self.changelog_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.changelog_path)
            .await;
        match result {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                let _ = file.write_all(line.as_bytes()).await;
            }
            Err(e) => warn!(error = %e, "Could not append to changelog"),
        }
    }
}

/// One worker session: acquire a permit and a clone, prepare the unit
/// branch, run the backend, enqueue the branch on success. The permit
/// guard releases on every exit path; the clone lease travels back to the
/// controller, which holds it until the merge resolves.
#[allow(clippy::too_many_arguments)]
async fn run_worker_task(
    unit: WorkUnit,
    objective: String,
    green_branch: String,
    permits: WorkerPermits,
    pool: Arc<WorkspacePool>,
    backend: Arc<dyn WorkerBackend>,
    queue: Arc<MergeQueue>,
    breakers: Arc<CircuitBreakerSet>,
    timeout: Duration,
) -> WorkerTaskResult {
    let _permit = permits.acquire().await;

    if !breakers.allow(WORKER_COMPONENT) {
        return WorkerTaskResult {
            unit,
            handle: None,
            envelope: None,
            submitted: false,
            failure: Some("worker circuit open".into()),
        };
    }

    let handle = match pool.acquire(Duration::from_secs(120)).await {
        Ok(handle) => handle,
        Err(e) => {
            return WorkerTaskResult {
                unit,
                handle: None,
                envelope: None,
                submitted: false,
                failure: Some(e.to_string()),
            };
        }
    };

    // Start the unit branch from the freshest verified line.
    let git = GitRunner::new(&handle.path);
    let prepared = async {
        git.fetch("origin").await?;
        git.run_checked(&[
            "checkout",
            "-B",
            &unit.branch_name,
            &format!("origin/{}", green_branch),
        ])
        .await?;
        Ok::<(), ForemanError>(())
    }
    .await;
    if let Err(e) = prepared {
        breakers.record(WORKER_COMPONENT, BreakerOutcome::Failure);
        return WorkerTaskResult {
            unit,
            handle: Some(handle),
            envelope: None,
            submitted: false,
            failure: Some(format!("branch preparation failed: {}", e)),
        };
    }

    let prompt = render_worker_prompt(&unit, &objective, &unit.branch_name, "");
    let request = WorkerRequest {
        unit: unit.clone(),
        workspace: handle.path.clone(),
        branch_name: unit.branch_name.clone(),
        prompt,
        timeout,
    };

    match backend.spawn(&request).await {
        Ok(envelope) => {
            breakers.record(WORKER_COMPONENT, BreakerOutcome::Success);
            let submitted = envelope.is_success() && !envelope.branch_ref.is_empty();
            if submitted {
                queue.submit(MergeSubmission {
                    unit_id: unit.id.clone(),
                    branch_ref: envelope.branch_ref.clone(),
                    workspace: handle.path.clone(),
                    envelope: envelope.clone(),
                    submitted_at: Instant::now(),
                });
            }
            WorkerTaskResult {
                unit,
                handle: Some(handle),
                envelope: Some(envelope),
                submitted,
                failure: None,
            }
        }
        Err(e) => {
            breakers.record(WORKER_COMPONENT, BreakerOutcome::Failure);
            WorkerTaskResult {
                unit,
                handle: Some(handle),
                envelope: None,
                submitted: false,
                failure: Some(e.to_string()),
            }
        }
    }
}
