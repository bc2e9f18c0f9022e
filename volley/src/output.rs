//! Persisting a run and printing its summary.
//!
//! Layout of a run directory:
//!
//! ```text
//! <output_dir>/<YYYYmmdd_HHMMSS>/
//!     results_overall.csv          one row per model, across prompts
//!     summary.json                 run metadata, per-group and overall stats
//!     <prompt>/prompt_info.json    the prompt as configured
//!     <prompt>/prompt_results.csv  one row per model for this prompt
//!     <prompt>/answers_<model>.json  every call record
//! ```

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use csv::Writer;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::config::PromptConfig;
use crate::errors::Result;
use crate::metrics::{CallStats, StatsView};
use crate::runner::{GroupReport, RunReport};
use crate::types::CallRecord;

/// File-name safe form of a model or prompt name.
pub fn sanitize_name(name: &str) -> String {
    name.replace(['/', ' '], "-")
}

/// One CSV row: a model's stats for a prompt or across all prompts.
#[derive(Debug, Serialize)]
struct ResultRow<'a> {
    model_name: &'a str,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    success_rate: f64,
    error_rate: f64,
    throughput: f64,
    avg_response_time: Option<f64>,
    min_response_time: Option<f64>,
    max_response_time: Option<f64>,
    total_input_tokens: u64,
    total_output_tokens: u64,
    total_cost: Decimal,
    cost_per_call: Option<Decimal>,
    errors_timeout: u64,
    errors_rate_limit: u64,
    errors_service_unavailable: u64,
    errors_authentication: u64,
    errors_validation: u64,
    errors_unknown: u64,
}

impl<'a> ResultRow<'a> {
    fn new(model_name: &'a str, stats: &CallStats, elapsed: Duration) -> Self {
        let view = StatsView::from(stats);
        Self {
            model_name,
            total_calls: view.total_calls,
            successful_calls: view.successful_calls,
            failed_calls: view.failed_calls,
            success_rate: view.success_rate,
            error_rate: view.error_rate,
            throughput: round2(throughput(stats.total_calls, elapsed)),
            avg_response_time: view.avg_response_time,
            min_response_time: view.min_response_time,
            max_response_time: view.max_response_time,
            total_input_tokens: view.total_input_tokens,
            total_output_tokens: view.total_output_tokens,
            total_cost: view.total_cost,
            cost_per_call: view.cost_per_successful_call,
            errors_timeout: view.timeout_errors,
            errors_rate_limit: view.rate_limit_errors,
            errors_service_unavailable: view.service_unavailable_errors,
            errors_authentication: view.authentication_errors,
            errors_validation: view.validation_errors,
            errors_unknown: view.unknown_errors,
        }
    }
}

#[derive(Serialize)]
struct Answers<'a> {
    model_name: &'a str,
    timestamp: DateTime<Utc>,
    prompt_info: Option<&'a PromptConfig>,
    complete: bool,
    metrics: StatsView,
    responses: &'a [CallRecord],
}

#[derive(Serialize)]
struct GroupEntry<'a> {
    model_name: &'a str,
    prompt_name: &'a str,
    started_at: DateTime<Utc>,
    elapsed_seconds: f64,
    throughput: f64,
    complete: bool,
    metrics: StatsView,
}

#[derive(Serialize)]
struct OverallEntry {
    groups: u64,
    metrics: StatsView,
}

#[derive(Serialize)]
struct RunSummary<'a> {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    interrupted: bool,
    groups: Vec<GroupEntry<'a>>,
    overall: OverallEntry,
}

/// Writes a [`RunReport`] into a timestamped run directory.
#[derive(Debug, Clone)]
pub struct RunWriter {
    base_dir: PathBuf,
}

impl RunWriter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    /// `<base_dir>/<YYYYmmdd_HHMMSS>` for the run's local start time.
    pub fn run_dir(&self, report: &RunReport) -> PathBuf {
        let stamp = report.started_at.with_timezone(&Local).format("%Y%m%d_%H%M%S");
        self.base_dir.join(stamp.to_string())
    }

    /// Write every output file and return the run directory.
    ///
    /// `prompts` supplies `prompt_info.json`; a prompt missing from it is
    /// written without one.
    pub fn write(&self, report: &RunReport, prompts: &[PromptConfig]) -> Result<PathBuf> {
        let run_dir = self.run_dir(report);
        fs::create_dir_all(&run_dir)?;

        let overall_path = run_dir.join("results_overall.csv");
        write_overall_csv(&overall_path, report)?;
        tracing::info!(path = %overall_path.display(), "Saved aggregated overall results");

        for label in report.prompt_labels() {
            let prompt_dir = run_dir.join(sanitize_name(label));
            fs::create_dir_all(&prompt_dir)?;

            let prompt_info = prompts.iter().find(|prompt| prompt.name == label);
            if let Some(prompt_info) = prompt_info {
                write_json(&prompt_dir.join("prompt_info.json"), prompt_info)?;
            }

            let groups: Vec<&GroupReport> = report
                .groups
                .iter()
                .filter(|group| group.summary.prompt_label == label)
                .collect();

            let results_path = prompt_dir.join("prompt_results.csv");
            write_rows(
                &results_path,
                groups
                    .iter()
                    .map(|group| ResultRow::new(&group.summary.model, &group.summary.stats, group.elapsed)),
            )?;
            tracing::info!(prompt = label, path = %results_path.display(), "Saved prompt results");

            for group in groups {
                let answers = Answers {
                    model_name: &group.summary.model,
                    timestamp: group.started_at,
                    prompt_info,
                    complete: group.complete,
                    metrics: StatsView::from(&group.summary.stats),
                    responses: &group.records,
                };
                let path = prompt_dir.join(format!("answers_{}.json", sanitize_name(&group.summary.model)));
                write_json(&path, &answers)?;
                tracing::debug!(prompt = label, model = %group.summary.model, path = %path.display(), "Saved responses");
            }
        }

        let summary = RunSummary {
            run_id: report.run_id,
            started_at: report.started_at,
            finished_at: report.finished_at,
            interrupted: report.interrupted,
            groups: report
                .groups
                .iter()
                .map(|group| GroupEntry {
                    model_name: &group.summary.model,
                    prompt_name: &group.summary.prompt_label,
                    started_at: group.started_at,
                    elapsed_seconds: group.elapsed.as_secs_f64(),
                    throughput: round2(group.throughput()),
                    complete: group.complete,
                    metrics: StatsView::from(&group.summary.stats),
                })
                .collect(),
            overall: OverallEntry {
                groups: report.overall.groups,
                metrics: StatsView::from(&report.overall.stats),
            },
        };
        write_json(&run_dir.join("summary.json"), &summary)?;

        Ok(run_dir)
    }
}

fn write_overall_csv(path: &Path, report: &RunReport) -> Result<()> {
    let by_model = report.by_model();
    write_rows(
        path,
        by_model
            .iter()
            .map(|model| ResultRow::new(&model.model, &model.stats, model_elapsed(report, &model.model))),
    )
}

fn write_rows<'a>(path: &Path, rows: impl IntoIterator<Item = ResultRow<'a>>) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

/// Wall time spent on one model's groups. Groups run one after another.
fn model_elapsed(report: &RunReport, model: &str) -> Duration {
    report
        .groups
        .iter()
        .filter(|group| group.summary.model == model)
        .map(|group| group.elapsed)
        .sum()
}

fn throughput(calls: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { calls as f64 / secs } else { 0.0 }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `$0.000123`, `$0.1234` or `$12.34` depending on magnitude.
pub fn format_cost(cost: Decimal) -> String {
    if cost < Decimal::new(1, 2) {
        format!("${cost:.6}")
    } else if cost < Decimal::ONE {
        format!("${cost:.4}")
    } else {
        format!("${cost:.2}")
    }
}

/// Fixed-width per-model table followed by run totals.
pub fn render_summary(report: &RunReport) -> String {
    let rule = "=".repeat(100);
    let mut out = String::new();

    let _ = writeln!(out, "\n{rule}\nBENCHMARK SUMMARY\n{rule}");
    let _ = writeln!(
        out,
        "{:<20} {:<8} {:<9} {:<10} {:<12} {:<12} {:<8}",
        "Model", "Calls", "Success%", "Avg Time", "Throughput", "Total Cost", "Errors"
    );
    let _ = writeln!(out, "{}", "-".repeat(100));

    for model in report.by_model() {
        let stats = &model.stats;
        let name: String = model.model.chars().take(19).collect();
        let avg = stats
            .avg_response_time()
            .map(|avg| format!("{:.3}s", avg.as_secs_f64()))
            .unwrap_or_else(|| "-".to_string());
        let rate = format!("{:.1}%", stats.success_rate() * 100.0);
        let throughput = format!("{:.2}/s", throughput(stats.total_calls, model_elapsed(report, &model.model)));
        let _ = writeln!(
            out,
            "{:<20} {:<8} {:<9} {:<10} {:<12} {:<12} {:<8}",
            name,
            stats.total_calls,
            rate,
            avg,
            throughput,
            format_cost(stats.total_cost),
            stats.failed_calls()
        );
    }
    let _ = writeln!(out, "{rule}");

    let overall = &report.overall.stats;
    let _ = writeln!(out, "\nOVERALL SUMMARY:");
    let _ = writeln!(out, "   - Total prompts tested: {}", report.prompt_labels().len());
    let _ = writeln!(out, "   - Total calls made: {}", overall.total_calls);
    let _ = writeln!(out, "   - Total successful calls: {}", overall.successful_calls);
    let _ = writeln!(out, "   - Overall success rate: {:.1}%", overall.success_rate() * 100.0);
    let _ = writeln!(out, "   - Total cost: ${:.6}", overall.total_cost);
    match overall.cost_per_successful_call() {
        Some(cost) => {
            let _ = writeln!(out, "   - Average cost per call: ${cost:.6}");
        }
        None => {
            let _ = writeln!(out, "   - Average cost per call: N/A");
        }
    }
    if report.interrupted {
        let _ = writeln!(out, "\nRun was interrupted; results are partial.");
    }

    out
}
