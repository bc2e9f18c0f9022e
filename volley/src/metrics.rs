//! Reduction of call records into summaries.
//!
//! Every summary carries [`CallStats`]: counts plus exact sums (integer
//! nanoseconds, integer tokens, decimal cost) and min/max. Averages, rates and
//! per-call cost are derived on read, never stored, so merging stats is exactly
//! associative and commutative and equals aggregating the underlying records
//! directly.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Serialize, Serializer};

use crate::errors::Result;
use crate::pricing::{CostCalculator, PricingTable};
use crate::types::{CallRecord, ErrorKind};

/// Failed calls per [`ErrorKind`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCounts {
    pub timeout: u64,
    pub rate_limit: u64,
    pub service_unavailable: u64,
    pub authentication: u64,
    pub validation: u64,
    pub unknown: u64,
}

impl ErrorCounts {
    pub fn record(&mut self, kind: ErrorKind) {
        *self.slot(kind) += 1;
    }

    pub fn get(&self, kind: ErrorKind) -> u64 {
        match kind {
            ErrorKind::Timeout => self.timeout,
            ErrorKind::RateLimit => self.rate_limit,
            ErrorKind::ServiceUnavailable => self.service_unavailable,
            ErrorKind::Authentication => self.authentication,
            ErrorKind::Validation => self.validation,
            ErrorKind::Unknown => self.unknown,
        }
    }

    pub fn total(&self) -> u64 {
        ErrorKind::ALL.iter().map(|kind| self.get(*kind)).sum()
    }

    pub fn merge(&mut self, other: &ErrorCounts) {
        for kind in ErrorKind::ALL {
            *self.slot(kind) += other.get(kind);
        }
    }

    fn slot(&mut self, kind: ErrorKind) -> &mut u64 {
        match kind {
            ErrorKind::Timeout => &mut self.timeout,
            ErrorKind::RateLimit => &mut self.rate_limit,
            ErrorKind::ServiceUnavailable => &mut self.service_unavailable,
            ErrorKind::Authentication => &mut self.authentication,
            ErrorKind::Validation => &mut self.validation,
            ErrorKind::Unknown => &mut self.unknown,
        }
    }
}

/// Sufficient statistics over a set of call records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    /// Sum of response times of successful calls
    pub response_time_sum: Duration,
    pub min_response_time: Option<Duration>,
    pub max_response_time: Option<Duration>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: Decimal,
    pub errors: ErrorCounts,
}

impl CallStats {
    /// Fold one record in. `cost` is the record's full-precision cost.
    pub fn record(&mut self, record: &CallRecord, cost: Decimal) {
        self.total_calls += 1;
        self.total_input_tokens += record.input_tokens();
        self.total_output_tokens += record.output_tokens();
        self.total_cost += cost;

        match record.error_kind() {
            None => {
                let elapsed = record.response_time();
                self.successful_calls += 1;
                self.response_time_sum += elapsed;
                self.min_response_time = Some(self.min_response_time.map_or(elapsed, |min| min.min(elapsed)));
                self.max_response_time = Some(self.max_response_time.map_or(elapsed, |max| max.max(elapsed)));
            }
            Some(kind) => self.errors.record(kind),
        }
    }

    pub fn merge(&mut self, other: &CallStats) {
        self.total_calls += other.total_calls;
        self.successful_calls += other.successful_calls;
        self.response_time_sum += other.response_time_sum;
        self.min_response_time = merge_option(self.min_response_time, other.min_response_time, Duration::min);
        self.max_response_time = merge_option(self.max_response_time, other.max_response_time, Duration::max);
        self.total_input_tokens += other.total_input_tokens;
        self.total_output_tokens += other.total_output_tokens;
        self.total_cost += other.total_cost;
        self.errors.merge(&other.errors);
    }

    pub fn failed_calls(&self) -> u64 {
        self.total_calls - self.successful_calls
    }

    /// Fraction of successful calls in `[0, 1]`; 0.0 for an empty set.
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.successful_calls as f64 / self.total_calls as f64
    }

    /// Fraction of failed calls in `[0, 1]`; 0.0 for an empty set.
    pub fn error_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.failed_calls() as f64 / self.total_calls as f64
    }

    /// Mean response time of successful calls, absent without any.
    pub fn avg_response_time(&self) -> Option<Duration> {
        if self.successful_calls == 0 {
            return None;
        }
        let nanos = self.response_time_sum.as_nanos() / u128::from(self.successful_calls);
        Some(Duration::from_nanos(nanos as u64))
    }

    /// Total cost divided by successful calls, absent without any.
    pub fn cost_per_successful_call(&self) -> Option<Decimal> {
        if self.successful_calls == 0 {
            return None;
        }
        Some(self.total_cost / Decimal::from(self.successful_calls))
    }
}

fn merge_option<T>(a: Option<T>, b: Option<T>, pick: impl FnOnce(T, T) -> T) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, b) => a.or(b),
    }
}

/// Statistics for one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub model: String,
    pub prompt_label: String,
    pub stats: CallStats,
}

/// Statistics folded across the groups of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverallSummary {
    pub groups: u64,
    pub stats: CallStats,
}

impl OverallSummary {
    pub fn merge(&mut self, other: &OverallSummary) {
        self.groups += other.groups;
        self.stats.merge(&other.stats);
    }
}

/// Statistics for one model across every prompt it was run with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSummary {
    pub model: String,
    /// Prompt labels in the order they were folded in
    pub prompts: Vec<String>,
    pub stats: CallStats,
}

/// Reduces records into summaries, pricing them against a [`PricingTable`].
#[derive(Debug, Clone, Copy)]
pub struct MetricsAggregator<'a> {
    pricing: &'a PricingTable,
    costs: CostCalculator<'a>,
}

impl<'a> MetricsAggregator<'a> {
    pub fn new(pricing: &'a PricingTable) -> Self {
        Self {
            pricing,
            costs: CostCalculator::new(pricing),
        }
    }

    /// Summarize one group's records.
    ///
    /// Fails with [`Error::PricingLookup`](crate::errors::Error::PricingLookup)
    /// if `model` has no pricing entry, even for an empty record set.
    pub fn summarize(&self, model: &str, prompt_label: &str, records: &[CallRecord]) -> Result<GroupSummary> {
        self.pricing.require(model)?;

        let mut stats = CallStats::default();
        for record in records {
            let cost = self.costs.cost(model, record.input_tokens(), record.output_tokens())?;
            stats.record(record, cost);
        }

        tracing::debug!(
            model,
            prompt = prompt_label,
            total_calls = stats.total_calls,
            successful_calls = stats.successful_calls,
            "Summarized group"
        );

        Ok(GroupSummary {
            model: model.to_string(),
            prompt_label: prompt_label.to_string(),
            stats,
        })
    }
}

/// Fold group summaries into a run-wide summary.
pub fn combine<'s>(summaries: impl IntoIterator<Item = &'s GroupSummary>) -> OverallSummary {
    summaries.into_iter().fold(OverallSummary::default(), |mut overall, group| {
        overall.groups += 1;
        overall.stats.merge(&group.stats);
        overall
    })
}

/// Fold group summaries per model, ordered by each model's first appearance.
pub fn combine_by_model<'s>(summaries: impl IntoIterator<Item = &'s GroupSummary>) -> Vec<ModelSummary> {
    let mut models: Vec<ModelSummary> = Vec::new();
    for group in summaries {
        match models.iter_mut().find(|summary| summary.model == group.model) {
            Some(summary) => {
                summary.prompts.push(group.prompt_label.clone());
                summary.stats.merge(&group.stats);
            }
            None => models.push(ModelSummary {
                model: group.model.clone(),
                prompts: vec![group.prompt_label.clone()],
                stats: group.stats.clone(),
            }),
        }
    }
    models
}

/// Rounded, presentation-ready view of [`CallStats`].
///
/// Seconds are rounded to 3 places, percentages to 2, costs to 6.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsView {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub avg_response_time: Option<f64>,
    pub min_response_time: Option<f64>,
    pub max_response_time: Option<f64>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    #[serde(serialize_with = "serialize_decimal")]
    pub total_cost: Decimal,
    #[serde(serialize_with = "serialize_optional_decimal")]
    pub cost_per_successful_call: Option<Decimal>,
    pub timeout_errors: u64,
    pub rate_limit_errors: u64,
    pub service_unavailable_errors: u64,
    pub authentication_errors: u64,
    pub validation_errors: u64,
    pub unknown_errors: u64,
}

impl From<&CallStats> for StatsView {
    fn from(stats: &CallStats) -> Self {
        let secs = |duration: Duration| round(duration.as_secs_f64(), 3);
        Self {
            total_calls: stats.total_calls,
            successful_calls: stats.successful_calls,
            failed_calls: stats.failed_calls(),
            success_rate: round(stats.success_rate() * 100.0, 2),
            error_rate: round(stats.error_rate() * 100.0, 2),
            avg_response_time: stats.avg_response_time().map(secs),
            min_response_time: stats.min_response_time.map(secs),
            max_response_time: stats.max_response_time.map(secs),
            total_input_tokens: stats.total_input_tokens,
            total_output_tokens: stats.total_output_tokens,
            total_cost: stats.total_cost.round_dp(6),
            cost_per_successful_call: stats.cost_per_successful_call().map(|cost| cost.round_dp(6)),
            timeout_errors: stats.errors.timeout,
            rate_limit_errors: stats.errors.rate_limit,
            service_unavailable_errors: stats.errors.service_unavailable,
            authentication_errors: stats.errors.authentication,
            validation_errors: stats.errors.validation,
            unknown_errors: stats.errors.unknown,
        }
    }
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn serialize_decimal<S: Serializer>(value: &Decimal, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

fn serialize_optional_decimal<S: Serializer>(value: &Option<Decimal>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(value) => serializer.collect_str(value),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::pricing::PricingEntry;
    use rstest::rstest;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn pricing() -> PricingTable {
        PricingTable::from_entries([
            PricingEntry::new("M", dec("0.00025"), dec("0.00125")),
            PricingEntry::new("N", dec("0.003"), dec("0.015")),
        ])
        .unwrap()
    }

    fn ok(call_id: u32, millis: u64, input: u64, output: u64) -> CallRecord {
        CallRecord::succeeded(call_id, Duration::from_millis(millis), input, output, "ok".to_string())
    }

    fn err(call_id: u32, millis: u64, kind: ErrorKind, input: u64) -> CallRecord {
        CallRecord::failed(call_id, Duration::from_millis(millis), input, 0, kind, "failed")
    }

    /// A varied record set: mixed outcomes, latencies and partial tokens.
    fn records() -> Vec<CallRecord> {
        let kinds = ErrorKind::ALL;
        (1..=30u32)
            .map(|id| {
                if id % 4 == 0 {
                    err(id, 37 * id as u64 % 500, kinds[id as usize % kinds.len()], (id % 3) as u64 * 5)
                } else {
                    ok(id, (id as u64 * 7919) % 1000 + 1, 10 + id as u64, 3 * id as u64)
                }
            })
            .collect()
    }

    #[test]
    fn test_summarize_empty_has_zero_rate_and_absent_timing() {
        let pricing = pricing();
        let summary = MetricsAggregator::new(&pricing).summarize("M", "P", &[]).unwrap();

        assert_eq!(summary.stats.total_calls, 0);
        assert_eq!(summary.stats.success_rate(), 0.0);
        assert_eq!(summary.stats.avg_response_time(), None);
        assert_eq!(summary.stats.min_response_time, None);
        assert_eq!(summary.stats.max_response_time, None);
        assert_eq!(summary.stats.total_cost, Decimal::ZERO);
        assert_eq!(summary.stats.cost_per_successful_call(), None);
    }

    #[test]
    fn test_summarize_five_calls_with_two_timeouts() {
        let pricing = pricing();
        let records = vec![
            ok(1, 100, 10, 20),
            err(2, 400, ErrorKind::Timeout, 0),
            ok(3, 300, 10, 20),
            err(4, 500, ErrorKind::Timeout, 0),
            ok(5, 200, 10, 20),
        ];

        let summary = MetricsAggregator::new(&pricing).summarize("M", "P", &records).unwrap();
        let stats = &summary.stats;

        assert_eq!(stats.total_calls, 5);
        assert_eq!(stats.successful_calls, 3);
        assert_eq!(stats.errors.timeout, 2);
        assert_eq!(stats.successful_calls + stats.errors.total(), stats.total_calls);
        assert_eq!(stats.success_rate(), 0.6);
        assert_eq!(stats.total_input_tokens, 30);
        assert_eq!(stats.total_output_tokens, 60);
        assert_eq!(stats.avg_response_time(), Some(Duration::from_millis(200)));
        assert_eq!(stats.min_response_time, Some(Duration::from_millis(100)));
        assert_eq!(stats.max_response_time, Some(Duration::from_millis(300)));
        // 30/1000 * 0.00025 + 60/1000 * 0.00125
        assert_eq!(stats.total_cost, dec("0.0000825"));
        assert_eq!(stats.cost_per_successful_call(), Some(dec("0.0000275")));
    }

    #[test]
    fn test_all_failures_keep_partial_tokens_and_no_timing() {
        let pricing = pricing();
        let records = vec![err(1, 10, ErrorKind::RateLimit, 7), err(2, 20, ErrorKind::Validation, 3)];

        let stats = MetricsAggregator::new(&pricing).summarize("N", "P", &records).unwrap().stats;

        assert_eq!(stats.success_rate(), 0.0);
        assert_eq!(stats.avg_response_time(), None);
        assert_eq!(stats.total_input_tokens, 10);
        assert_eq!(stats.errors.rate_limit, 1);
        assert_eq!(stats.errors.validation, 1);
        assert_eq!(stats.total_cost, dec("0.00003"));
    }

    #[test]
    fn test_summarize_unpriced_model_is_a_lookup_error() {
        let pricing = pricing();
        let err = MetricsAggregator::new(&pricing)
            .summarize("Unknown-Model", "P", &[ok(1, 10, 1, 1)])
            .unwrap_err();
        assert!(matches!(err, Error::PricingLookup { model } if model == "Unknown-Model"));
    }

    #[rstest]
    #[case::singletons(&[1; 30])]
    #[case::halves(&[15, 15])]
    #[case::uneven(&[1, 2, 3, 5, 8, 11])]
    #[case::with_empty_groups(&[0, 10, 0, 20, 0])]
    #[case::one_group(&[30])]
    #[case::ragged(&[7, 13, 4, 6])]
    fn test_combine_of_partition_equals_direct_aggregation(#[case] sizes: &[usize]) {
        let pricing = pricing();
        let aggregator = MetricsAggregator::new(&pricing);
        let records = records();
        assert_eq!(sizes.iter().sum::<usize>(), records.len());

        let direct = aggregator.summarize("M", "all", &records).unwrap().stats;

        let mut groups = Vec::new();
        let mut start = 0;
        for (i, size) in sizes.iter().enumerate() {
            groups.push(aggregator.summarize("M", &format!("part-{i}"), &records[start..start + size]).unwrap());
            start += size;
        }

        let forward = combine(&groups);
        assert_eq!(forward.stats, direct);
        assert_eq!(forward.groups, sizes.len() as u64);

        let reversed = combine(groups.iter().rev());
        assert_eq!(reversed.stats, direct);

        // (a + b) + c == a + (b + c)
        let (left, right) = groups.split_at(groups.len() / 2);
        let mut left_first = combine(left);
        left_first.merge(&combine(right));
        let mut right_first = combine(right);
        right_first.merge(&combine(left));
        assert_eq!(left_first, forward);
        assert_eq!(right_first, forward);
    }

    #[test]
    fn test_combine_does_not_average_averages() {
        let pricing = pricing();
        let aggregator = MetricsAggregator::new(&pricing);

        let one_fast = aggregator.summarize("M", "a", &[ok(1, 100, 0, 0)]).unwrap();
        let three_slow = aggregator
            .summarize("M", "b", &[ok(1, 500, 0, 0), ok(2, 500, 0, 0), ok(3, 500, 0, 0)])
            .unwrap();

        let overall = combine([&one_fast, &three_slow]);
        assert_eq!(overall.stats.avg_response_time(), Some(Duration::from_millis(400)));
    }

    #[test]
    fn test_combine_by_model_keeps_first_appearance_order() {
        let pricing = pricing();
        let aggregator = MetricsAggregator::new(&pricing);
        let groups = vec![
            aggregator.summarize("N", "p1", &[ok(1, 10, 1, 1)]).unwrap(),
            aggregator.summarize("M", "p1", &[ok(1, 10, 1, 1), err(2, 5, ErrorKind::Unknown, 0)]).unwrap(),
            aggregator.summarize("N", "p2", &[err(1, 10, ErrorKind::Timeout, 0)]).unwrap(),
        ];

        let by_model = combine_by_model(&groups);

        assert_eq!(by_model.len(), 2);
        assert_eq!(by_model[0].model, "N");
        assert_eq!(by_model[0].prompts, vec!["p1", "p2"]);
        assert_eq!(by_model[0].stats.total_calls, 2);
        assert_eq!(by_model[0].stats.errors.timeout, 1);
        assert_eq!(by_model[1].model, "M");
        assert_eq!(by_model[1].stats.total_calls, 2);
    }

    #[test]
    fn test_stats_view_rounds_for_presentation() {
        let pricing = pricing();
        let records = vec![ok(1, 1234, 1, 1), ok(2, 1000, 1, 1), err(3, 1, ErrorKind::Timeout, 0)];
        let stats = MetricsAggregator::new(&pricing).summarize("M", "P", &records).unwrap().stats;

        let view = StatsView::from(&stats);

        assert_eq!(view.success_rate, 66.67);
        assert_eq!(view.error_rate, 33.33);
        assert_eq!(view.avg_response_time, Some(1.117));
        assert_eq!(view.max_response_time, Some(1.234));
        assert_eq!(view.total_cost, dec("0.000003"));
        assert_eq!(view.failed_calls, 1);
        assert_eq!(view.timeout_errors, 1);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["total_cost"], "0.000003");
    }
}
