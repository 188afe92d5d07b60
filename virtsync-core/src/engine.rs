//! Run driver: one reconciliation pass per configured object type

use tracing::{debug, error, info};

use crate::config::Config;
use crate::model::ObjectType;
use crate::protocol::AgentQuery;
use crate::reconcile::{Reconciler, RunContext};
use crate::registry::Registry;
use crate::report::{ReportAggregator, SyncOutcome};

pub struct Engine<'a, R: Registry + ?Sized, A: AgentQuery + ?Sized> {
    registry: &'a R,
    agent: &'a A,
    ctx: RunContext,
}

impl<'a, R: Registry + ?Sized, A: AgentQuery + ?Sized> Engine<'a, R, A> {
    pub fn new(registry: &'a R, agent: &'a A, ctx: RunContext) -> Self {
        Self { registry, agent, ctx }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Processes VMs, hypervisors then datastores. A failed type is recorded
    /// in the report and the next type still runs.
    pub async fn run(&self, config: &Config) -> SyncOutcome {
        let reconciler = Reconciler::new(self.registry, self.agent, &self.ctx);
        let mut report = ReportAggregator::new();

        info!(
            run_id = %report.run_id(),
            action = %self.ctx.action(),
            force = self.ctx.force(),
            workers = self.ctx.workers(),
            "starting reconciliation run"
        );

        for object_type in ObjectType::ALL {
            let Some(section) = config.object_type(object_type) else {
                debug!(object_type = %object_type, "not configured, skipped");
                continue;
            };

            report = match reconciler.sync_type(object_type, section).await {
                Ok(outcome) => {
                    info!(
                        object_type = %object_type,
                        added = outcome.added.len(),
                        removed = outcome.removed.len(),
                        held = outcome.removal_held,
                        "pass completed"
                    );
                    report.absorb(object_type, outcome)
                }
                Err(aborted) => {
                    error!(
                        object_type = %object_type,
                        error = %aborted.error,
                        added = aborted.partial.added.len(),
                        "pass aborted"
                    );
                    report
                        .absorb(object_type, aborted.partial)
                        .record_failure(object_type, &aborted.error)
                }
            };
        }

        report.finalize()
    }
}
