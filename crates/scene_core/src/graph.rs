//! Concurrent execution graph.
//!
//! Stages are levelled topologically over their dependency sets. Each level
//! runs as a fan-out group of tokio tasks, and the next level is its fan-in
//! join: it starts only after every branch of the previous level reached a
//! terminal status.
//!
//! Branches publish into their own [`PendingContext`]. After the join the
//! supervisor commits the buffers in stage order, never in arrival order.
//! A fatal branch failure aborts the siblings, marks them cancelled and
//! discards every buffer of the level.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use scene_agents::AgentRole;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::{EventType, PendingContext};
use crate::driver::{StageDriver, StageOutcome};
use crate::error::{CoreError, CoreResult};
use crate::recovery::{ErrorContext, ErrorKind};
use crate::stage::{resolve_dependencies, PipelineState, PipelineTrace, StageRecord, StageStatus};

/// Outcome of running one pass over a set of stages.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Every stage record of the pass, in stage order
    pub records: Vec<StageRecord>,
    pub outcomes: BTreeMap<AgentRole, StageOutcome>,
    /// The failure that ended the pass, if any
    pub error: Option<ErrorContext>,
}

impl PassReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn push_record(&mut self, record: StageRecord) {
        self.records.push(record);
        self.records.sort_by_key(|r| r.ordinal);
    }
}

/// Commit a finished stage and advance the trace.
pub(crate) fn commit_stage(
    driver: &StageDriver,
    trace: &mut PipelineTrace,
    role: AgentRole,
    iteration: u32,
    pending: PendingContext,
) {
    let committed = driver.bus().commit(pending);
    debug!("Committed {} entries from {}", committed.len(), role);
    if let Err(e) = trace.advance(PipelineState::for_role(role), iteration) {
        warn!("Trace refused {}: {}", role, e);
    }
}

struct BranchReport {
    role: AgentRole,
    record: StageRecord,
    pending: PendingContext,
    result: Result<StageOutcome, ErrorContext>,
}

/// Topologically levelled stage graph.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    dependencies: BTreeMap<AgentRole, BTreeSet<AgentRole>>,
    levels: Vec<Vec<AgentRole>>,
}

impl ExecutionGraph {
    /// Build the graph for `roles` using the default dependency sets.
    pub fn new(roles: &BTreeSet<AgentRole>) -> CoreResult<Self> {
        let stage_roles: BTreeSet<AgentRole> = roles.iter().map(|r| r.stage_role()).collect();
        let dependencies = stage_roles
            .iter()
            .map(|role| (*role, resolve_dependencies(*role, &stage_roles)))
            .collect();
        Self::from_dependencies(dependencies)
    }

    /// Build the graph from explicit dependency sets (Kahn's algorithm).
    pub fn from_dependencies(dependencies: BTreeMap<AgentRole, BTreeSet<AgentRole>>) -> CoreResult<Self> {
        let mut in_degree: BTreeMap<AgentRole, usize> = dependencies
            .iter()
            .map(|(role, deps)| (*role, deps.iter().filter(|d| dependencies.contains_key(d)).count()))
            .collect();

        let mut levels = Vec::new();
        let mut placed = 0;
        while placed < dependencies.len() {
            let mut level: Vec<AgentRole> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(role, _)| *role)
                .collect();
            if level.is_empty() {
                return Err(CoreError::InvalidConfig("stage dependencies contain a cycle".into()));
            }
            level.sort_by_key(|r| r.ordinal());

            for role in &level {
                in_degree.remove(role);
                for (other, deps) in &dependencies {
                    if deps.contains(role) {
                        if let Some(degree) = in_degree.get_mut(other) {
                            *degree = degree.saturating_sub(1);
                        }
                    }
                }
            }
            placed += level.len();
            levels.push(level);
        }

        Ok(Self { dependencies, levels })
    }

    pub fn levels(&self) -> &[Vec<AgentRole>] {
        &self.levels
    }

    pub fn dependencies_of(&self, role: AgentRole) -> BTreeSet<AgentRole> {
        self.dependencies.get(&role).cloned().unwrap_or_default()
    }

    /// Run every level, fanning out within a level.
    ///
    /// A failure of a role in `tolerated` is recorded without aborting the
    /// pass.
    pub async fn run_pass(
        &self,
        driver: &Arc<StageDriver>,
        iteration: u32,
        feedback: Option<String>,
        tolerated: &BTreeSet<AgentRole>,
        trace: &mut PipelineTrace,
    ) -> PassReport {
        let mut report = PassReport::default();

        for (index, level) in self.levels.iter().enumerate() {
            debug!("Level {}: {:?}", index, level);
            let mut records: BTreeMap<AgentRole, StageRecord> = BTreeMap::new();
            let mut tasks = JoinSet::new();

            for role in level {
                let mut record = StageRecord::new(*role, iteration).with_dependencies(self.dependencies_of(*role));
                if !driver.claim_dispatch(*role) {
                    driver.skip_stage(&mut record, "removed from agent set");
                    report.push_record(record);
                    continue;
                }
                records.insert(*role, record.clone());

                let driver = Arc::clone(driver);
                let feedback = feedback.clone();
                let role = *role;
                tasks.spawn(async move {
                    let mut record = record;
                    let mut pending = PendingContext::new(role);
                    let result = driver.run_stage(&mut record, feedback.as_deref(), &mut pending).await;
                    BranchReport {
                        role,
                        record,
                        pending,
                        result,
                    }
                });
            }

            let mut finished: BTreeMap<AgentRole, BranchReport> = BTreeMap::new();
            let mut fatal: Option<ErrorContext> = None;
            let mut panicked: Option<String> = None;

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(branch) => {
                        if let Err(err) = &branch.result {
                            if tolerated.contains(&branch.role) {
                                warn!("Tolerating failure of {}: {}", branch.role, err);
                            } else if fatal.is_none() {
                                error!("Fatal failure in {}, cancelling siblings", branch.role);
                                fatal = Some(err.clone());
                                tasks.abort_all();
                            }
                        }
                        finished.insert(branch.role, branch);
                    }
                    Err(join_error) if join_error.is_cancelled() => {}
                    Err(join_error) => {
                        error!("Stage branch panicked: {}", join_error);
                        panicked.get_or_insert_with(|| join_error.to_string());
                        tasks.abort_all();
                    }
                }
            }

            if fatal.is_none() {
                if let Some(message) = panicked {
                    let role = records
                        .keys()
                        .find(|r| !finished.contains_key(r))
                        .copied()
                        .unwrap_or(level[0]);
                    fatal = Some(ErrorContext::new(
                        ErrorKind::AgentFailure,
                        role,
                        format!("stage task panicked: {}", message),
                    ));
                }
            }

            let now = driver.clock().now();
            if let Some(err) = fatal {
                for (role, mut record) in records {
                    match finished.remove(&role) {
                        Some(branch) => {
                            driver.bus().discard(branch.pending);
                            report.push_record(branch.record);
                        }
                        None => {
                            let _ = record.transition(StageStatus::Cancelled, now);
                            driver.bus().log_event(EventType::StageCancelled, Some(role), "sibling failed");
                            report.push_record(record);
                        }
                    }
                }
                report.error = Some(err);
                return report;
            }

            let mut branches: Vec<BranchReport> = finished.into_values().collect();
            branches.sort_by_key(|b| b.record.ordinal);
            for branch in branches {
                match branch.result {
                    Ok(outcome) => {
                        commit_stage(driver, trace, branch.role, iteration, branch.pending);
                        report.outcomes.insert(branch.role, outcome);
                    }
                    Err(_) => driver.bus().discard(branch.pending),
                }
                report.push_record(branch.record);
            }
            info!("Level {} joined", index);
        }

        report
    }
}
