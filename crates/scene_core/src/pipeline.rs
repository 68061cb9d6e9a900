//! Stage pipeline.
//!
//! Drives one session from `Init` to `Done` or `Failed`:
//!
//! 1. a first pass over the session's agent set, sequential or concurrent;
//! 2. the critique loop, re-running the earliest targeted builder stage and
//!    every active builder downstream of it while the critique asks for
//!    refinement and iterations remain;
//! 3. finalization, which renders the scene when rendering is enabled.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use scene_agents::{AgentRole, CritiqueVerdict};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ResolvedOptions, SchedulingMode};
use crate::context::{EventType, PendingContext};
use crate::driver::StageDriver;
use crate::graph::{commit_stage, ExecutionGraph, PassReport};
use crate::recovery::{ErrorContext, ErrorKind, RecoveryAction};
use crate::result::GenerationResult;
use crate::stage::{resolve_dependencies, PipelineState, PipelineTrace, StageRecord};

/// Builder stages a refine revisits when the critique names none.
const DEFAULT_REFINE_TARGETS: [AgentRole; 3] = [AgentRole::Structure, AgentRole::Surface, AgentRole::LightCamera];

/// Everything a finished pipeline produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub result: GenerationResult,
    /// Stage records of every iteration, in execution order
    pub stages: Vec<StageRecord>,
    pub trace: PipelineTrace,
}

/// Stages a refine pass re-runs.
///
/// The earliest active target plus every active builder after it, then the
/// critique.
pub fn refine_roles(targets: &[AgentRole], active: &BTreeSet<AgentRole>) -> BTreeSet<AgentRole> {
    let start = earliest_active(targets.iter().copied(), active)
        .or_else(|| earliest_active(DEFAULT_REFINE_TARGETS.iter().copied(), active));

    let mut roles: BTreeSet<AgentRole> = match start {
        Some(start) => active
            .iter()
            .copied()
            .filter(|r| r.is_refinable() && r.ordinal() >= start.ordinal())
            .collect(),
        None => BTreeSet::new(),
    };
    if active.contains(&AgentRole::Critique) {
        roles.insert(AgentRole::Critique);
    }
    roles
}

fn earliest_active(candidates: impl Iterator<Item = AgentRole>, active: &BTreeSet<AgentRole>) -> Option<AgentRole> {
    candidates
        .map(|r| r.stage_role())
        .filter(|r| r.is_refinable() && active.contains(r))
        .min_by_key(|r| r.ordinal())
}

/// One session's pipeline.
pub struct StagePipeline {
    driver: Arc<StageDriver>,
    options: ResolvedOptions,
}

impl StagePipeline {
    pub fn new(driver: Arc<StageDriver>, options: ResolvedOptions) -> Self {
        Self { driver, options }
    }

    pub fn driver(&self) -> &Arc<StageDriver> {
        &self.driver
    }

    /// Run the session to completion. Never panics on agent or executor
    /// failures; they end up in the result.
    pub async fn run(self) -> PipelineOutcome {
        let started = Instant::now();
        let mut trace = PipelineTrace::new();
        let mut stages = Vec::new();
        let mut iteration = 1;
        let mut feedback: Option<String> = None;
        let mut final_rating = None;
        let mut pass_roles = self.options.agents.clone();

        loop {
            let report = self.run_pass(&pass_roles, iteration, feedback.clone(), &mut trace).await;
            stages.extend(report.records);
            if let Some(error) = report.error {
                return self.fail(error, iteration, final_rating, stages, trace, started);
            }

            let Some(verdict) = report
                .outcomes
                .get(&AgentRole::Critique)
                .and_then(|o| o.verdict.clone())
            else {
                break;
            };
            final_rating = Some(verdict.rating);

            if !self.wants_refine(&verdict) {
                break;
            }
            if iteration >= self.options.max_iterations {
                info!("Refine requested but iteration limit {} reached", self.options.max_iterations);
                break;
            }

            if let Err(e) = trace.advance(PipelineState::Refine, iteration) {
                warn!("Trace refused refine: {}", e);
            }
            iteration += 1;
            let active = self.driver.current_agents().unwrap_or_else(|| self.options.agents.clone());
            pass_roles = refine_roles(&verdict.targets, &self.critique_gated(active));
            info!("Refining (iteration {}): {:?}", iteration, pass_roles);
            self.driver.bus().log_event(
                EventType::Refine,
                Some(AgentRole::Critique),
                format!("iteration {}: {}", iteration, verdict.feedback),
            );
            self.driver.progress(PipelineState::Refine.as_str(), None, verdict.feedback.as_str());

            if pass_roles.contains(&AgentRole::Structure) {
                self.driver.reset_scene().await;
            }
            feedback = Some(verdict.feedback).filter(|f| !f.trim().is_empty());
        }

        match self.driver.finalize(&self.options).await {
            Ok(reference) => {
                if let Err(e) = trace.advance(PipelineState::Done, iteration) {
                    warn!("Trace refused done: {}", e);
                }
                let result = GenerationResult::success(self.driver.session_id(), reference, iteration)
                    .with_rating(final_rating)
                    .with_substitutions(self.driver.router().substitutions())
                    .with_elapsed_ms(started.elapsed().as_millis() as u64);
                info!("{}", result.summary());
                PipelineOutcome { result, stages, trace }
            }
            Err(error) => self.fail(error, iteration, final_rating, stages, trace, started),
        }
    }

    /// Whether the verdict sends the pipeline back for another iteration.
    ///
    /// A rating below the acceptability threshold is a validation failure
    /// that the router defers to this loop, forcing a refine.
    fn wants_refine(&self, verdict: &CritiqueVerdict) -> bool {
        let router = self.driver.router();
        let threshold = router.policy().acceptability_threshold;
        if verdict.rating >= threshold {
            return verdict.should_refine;
        }

        let error = ErrorContext::new(
            ErrorKind::ValidationFailure,
            AgentRole::Critique,
            format!("rating {:.1} below {:.1}", verdict.rating, threshold),
        );
        match router.handle(&error).action {
            RecoveryAction::DeferToCritique => {
                self.driver
                    .bus()
                    .log_event(EventType::ValidationDeferred, Some(AgentRole::Critique), error.message);
                true
            }
            _ => verdict.should_refine,
        }
    }

    fn critique_gated(&self, mut roles: BTreeSet<AgentRole>) -> BTreeSet<AgentRole> {
        if !self.options.enable_critique {
            roles.remove(&AgentRole::Critique);
        }
        roles
    }

    async fn run_pass(
        &self,
        roles: &BTreeSet<AgentRole>,
        iteration: u32,
        feedback: Option<String>,
        trace: &mut PipelineTrace,
    ) -> PassReport {
        match self.options.scheduling {
            SchedulingMode::Sequential => self.run_sequential(roles, iteration, feedback.as_deref(), trace).await,
            SchedulingMode::Concurrent => {
                let mut planned = roles.clone();
                if iteration == 1 {
                    if let Some(current) = self.driver.current_agents() {
                        planned.extend(current);
                    }
                }
                let planned = self.critique_gated(planned);
                match ExecutionGraph::new(&planned) {
                    Ok(graph) => {
                        graph
                            .run_pass(&self.driver, iteration, feedback, &self.options.tolerated_roles, trace)
                            .await
                    }
                    Err(e) => PassReport {
                        error: Some(ErrorContext::new(ErrorKind::AgentFailure, AgentRole::Concept, e.to_string())),
                        ..Default::default()
                    },
                }
            }
        }
    }

    /// One stage at a time in stage order. Roles added to the session before
    /// their turn during the first pass are picked up.
    async fn run_sequential(
        &self,
        roles: &BTreeSet<AgentRole>,
        iteration: u32,
        feedback: Option<&str>,
        trace: &mut PipelineTrace,
    ) -> PassReport {
        let mut report = PassReport::default();
        let mut last_ordinal: Option<usize> = None;

        loop {
            let mut wanted = roles.clone();
            if iteration == 1 {
                if let Some(current) = self.driver.current_agents() {
                    wanted.extend(current);
                }
            }
            let next = self
                .critique_gated(wanted)
                .into_iter()
                .filter(|r| last_ordinal.map_or(true, |last| r.ordinal() > last))
                .min_by_key(|r| r.ordinal());
            let Some(role) = next else {
                break;
            };
            last_ordinal = Some(role.ordinal());

            let mut record =
                StageRecord::new(role, iteration).with_dependencies(resolve_dependencies(role, roles));
            if !self.driver.claim_dispatch(role) {
                self.driver.skip_stage(&mut record, "removed from agent set");
                report.records.push(record);
                continue;
            }

            let mut pending = PendingContext::new(role);
            let result = self.driver.run_stage(&mut record, feedback, &mut pending).await;
            report.records.push(record);
            match result {
                Ok(outcome) => {
                    commit_stage(&self.driver, trace, role, iteration, pending);
                    report.outcomes.insert(role, outcome);
                }
                Err(error) if self.options.tolerated_roles.contains(&role) => {
                    warn!("Tolerating failure of {}: {}", role, error);
                    self.driver.bus().discard(pending);
                }
                Err(error) => {
                    self.driver.bus().discard(pending);
                    report.error = Some(error);
                    break;
                }
            }
        }

        report
    }

    fn fail(
        &self,
        error: ErrorContext,
        iteration: u32,
        final_rating: Option<f64>,
        stages: Vec<StageRecord>,
        mut trace: PipelineTrace,
        started: Instant,
    ) -> PipelineOutcome {
        if let Err(e) = trace.advance(PipelineState::Failed, iteration) {
            warn!("Trace refused failed: {}", e);
        }
        let result = GenerationResult::failure(self.driver.session_id(), error, iteration)
            .with_rating(final_rating)
            .with_substitutions(self.driver.router().substitutions())
            .with_elapsed_ms(started.elapsed().as_millis() as u64);
        warn!("{}", result.summary());
        PipelineOutcome { result, stages, trace }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(roles: &[AgentRole]) -> BTreeSet<AgentRole> {
        roles.iter().copied().collect()
    }

    #[test]
    fn test_refine_roles_default_targets() {
        let active = set(&[
            AgentRole::Concept,
            AgentRole::Structure,
            AgentRole::Surface,
            AgentRole::LightCamera,
            AgentRole::Motion,
            AgentRole::Critique,
        ]);
        assert_eq!(
            refine_roles(&[], &active),
            set(&[
                AgentRole::Structure,
                AgentRole::Surface,
                AgentRole::LightCamera,
                AgentRole::Motion,
                AgentRole::Critique,
            ])
        );
    }

    #[test]
    fn test_refine_roles_earliest_target() {
        let active = set(&[
            AgentRole::Concept,
            AgentRole::Structure,
            AgentRole::Surface,
            AgentRole::LightCamera,
            AgentRole::Critique,
        ]);
        assert_eq!(
            refine_roles(&[AgentRole::LightCamera, AgentRole::Surface], &active),
            set(&[AgentRole::Surface, AgentRole::LightCamera, AgentRole::Critique])
        );
        // Inactive targets fall back to the defaults
        assert_eq!(
            refine_roles(&[AgentRole::Motion], &active),
            set(&[
                AgentRole::Structure,
                AgentRole::Surface,
                AgentRole::LightCamera,
                AgentRole::Critique,
            ])
        );
    }
}
