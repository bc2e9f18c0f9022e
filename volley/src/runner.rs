//! Run orchestration: preflight, sequential dispatch, aggregation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::errors::Result;
use crate::invoker::CallInvoker;
use crate::metrics::{GroupSummary, MetricsAggregator, ModelSummary, OverallSummary, combine, combine_by_model};
use crate::pricing::PricingTable;
use crate::types::{CallRecord, WorkItem};

/// One work item's records and summary, with the wall time it took.
#[derive(Debug, Clone)]
pub struct GroupReport {
    pub summary: GroupSummary,
    pub records: Vec<CallRecord>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// False if the run was cancelled before every call was captured
    pub complete: bool,
}

impl GroupReport {
    /// Calls per second of wall time across the whole group.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.summary.stats.total_calls as f64 / secs
        } else {
            0.0
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub groups: Vec<GroupReport>,
    pub overall: OverallSummary,
    /// True if cancellation stopped the run early
    pub interrupted: bool,
}

impl RunReport {
    pub fn by_model(&self) -> Vec<ModelSummary> {
        combine_by_model(self.groups.iter().map(|group| &group.summary))
    }

    /// Distinct prompt labels in the order they ran.
    pub fn prompt_labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::new();
        for group in &self.groups {
            if !labels.contains(&group.summary.prompt_label.as_str()) {
                labels.push(&group.summary.prompt_label);
            }
        }
        labels
    }
}

/// Drives a list of work items through the dispatcher one at a time.
pub struct Runner<I: CallInvoker> {
    dispatcher: Arc<Dispatcher<I>>,
    pricing: PricingTable,
    concurrency: usize,
}

impl<I> Runner<I>
where
    I: CallInvoker + 'static,
{
    pub fn new(dispatcher: Arc<Dispatcher<I>>, pricing: PricingTable, concurrency: usize) -> Self {
        Self {
            dispatcher,
            pricing,
            concurrency,
        }
    }

    /// Check every work item and its pricing before any call is made.
    pub fn preflight(&self, items: &[WorkItem]) -> Result<()> {
        for item in items {
            Dispatcher::<I>::validate(item, self.concurrency)?;
            self.pricing.require(&item.model.name)?;
        }
        Ok(())
    }

    /// Run every work item in order.
    ///
    /// Stops issuing calls once `cancel` fires; the group that was running is
    /// kept with whatever records it captured and later groups are skipped.
    #[tracing::instrument(skip_all, fields(groups = items.len(), concurrency = self.concurrency))]
    pub async fn run(&self, items: &[WorkItem], cancel: &CancellationToken) -> Result<RunReport> {
        self.preflight(items)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let aggregator = MetricsAggregator::new(&self.pricing);
        let mut groups = Vec::with_capacity(items.len());

        tracing::info!(%run_id, "Starting benchmark run");

        for item in items {
            if cancel.is_cancelled() {
                break;
            }

            tracing::info!(
                model = %item.model.name,
                prompt = %item.prompt_label,
                calls = item.call_count,
                "Starting benchmark group"
            );

            let group_started_at = Utc::now();
            let timer = Instant::now();
            let records = self.dispatcher.run_until_cancelled(item, self.concurrency, cancel).await?;
            let elapsed = timer.elapsed();

            let summary = aggregator.summarize(&item.model.name, &item.prompt_label, &records)?;
            let complete = records.len() == item.call_count as usize;

            let report = GroupReport {
                summary,
                records,
                started_at: group_started_at,
                elapsed,
                complete,
            };

            let stats = &report.summary.stats;
            tracing::info!(
                model = %item.model.name,
                prompt = %item.prompt_label,
                success_rate = %format!("{:.1}%", stats.success_rate() * 100.0),
                avg_response_time = ?stats.avg_response_time(),
                total_cost = %stats.total_cost.round_dp(6),
                throughput = %format!("{:.2}/s", report.throughput()),
                complete,
                "Completed benchmark group"
            );

            groups.push(report);
        }

        let overall = combine(groups.iter().map(|group| &group.summary));
        let interrupted = cancel.is_cancelled();
        if interrupted {
            tracing::warn!(completed_groups = groups.len(), total_groups = items.len(), "Benchmark run interrupted");
        }

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            groups,
            overall,
            interrupted,
        })
    }
}
