//! Concurrent load and cost benchmarking for text-generation APIs.
//!
//! This crate drives a matrix of (model, prompt) work items against a remote
//! generation API and:
//! - Issues each work item's calls through a bounded worker pool
//! - Classifies every failure into a closed set of error kinds
//! - Folds per-call records into exact, mergeable summary statistics
//! - Prices token usage per model in full decimal precision
//!
//! # Example
//! ```ignore
//! use volley::{Dispatcher, DispatcherConfig, OpenAiInvoker, PricingTable, Runner};
//!
//! let invoker = Arc::new(OpenAiInvoker::new(reqwest::Client::new(), &endpoint, api_key, timeout));
//! let dispatcher = Arc::new(Dispatcher::new(invoker, DispatcherConfig::default()));
//! let runner = Runner::new(dispatcher, pricing, 10);
//!
//! let report = runner.run(&work_items, &CancellationToken::new()).await?;
//! println!("{}", volley::output::render_summary(&report));
//! ```

pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod invoker;
pub mod metrics;
pub mod output;
pub mod pricing;
pub mod runner;
pub mod telemetry;
pub mod types;

// Re-export commonly used types
pub use classify::{CallFailure, classify};
pub use config::{Args, Config};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use errors::{Error, Result};
pub use invoker::{CallInvoker, CallRequest, Invocation, MockInvoker, MockResponse, OpenAiInvoker};
pub use metrics::{CallStats, GroupSummary, MetricsAggregator, ModelSummary, OverallSummary, combine, combine_by_model};
pub use pricing::{CostCalculator, PricingEntry, PricingTable};
pub use runner::{GroupReport, RunReport, Runner};
pub use types::{CallId, CallRecord, ErrorKind, ModelParams, WorkItem};

#[cfg(test)]
mod test;
