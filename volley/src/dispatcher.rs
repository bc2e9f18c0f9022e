//! Bounded concurrent dispatch of one work item's calls.
//!
//! A fixed pool of `min(concurrency_limit, call_count)` workers pulls call
//! indices from a shared counter. Each worker writes its record into a slot
//! pre-allocated for that index, so the result is in call-id order no matter
//! how completions interleave, and no call ever waits on another call's
//! result. Failures stay inside their record: an invoker error, a per-call
//! deadline or even a panic produces a failed [`CallRecord`] and the sibling
//! calls carry on.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::classify::{CallFailure, classify};
use crate::errors::{Error, Result};
use crate::invoker::{CallInvoker, CallRequest, Invocation};
use crate::types::{CallId, CallRecord, WorkItem};

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Hard deadline for a single call, enforced around the invoker.
    /// Elapsing it is recorded as a timeout failure.
    pub call_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(600),
        }
    }
}

/// Runs the calls of a work item through a bounded worker pool.
pub struct Dispatcher<I: CallInvoker> {
    invoker: Arc<I>,
    config: DispatcherConfig,
    calls_in_flight: Arc<AtomicUsize>,
}

impl<I> Dispatcher<I>
where
    I: CallInvoker + 'static,
{
    pub fn new(invoker: Arc<I>, config: DispatcherConfig) -> Self {
        Self {
            invoker,
            config,
            calls_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Calls currently waiting on the invoker.
    pub fn calls_in_flight(&self) -> usize {
        self.calls_in_flight.load(Ordering::Relaxed)
    }

    /// Reject work the dispatcher must not start.
    pub fn validate(item: &WorkItem, concurrency_limit: usize) -> Result<()> {
        if concurrency_limit == 0 {
            return Err(Error::configuration("concurrency limit must be at least 1"));
        }
        item.validate()
    }

    /// Issue every call of `item`, at most `concurrency_limit` at a time.
    ///
    /// Returns one record per call, ordered by call id.
    pub async fn run(&self, item: &WorkItem, concurrency_limit: usize) -> Result<Vec<CallRecord>> {
        self.run_until_cancelled(item, concurrency_limit, &CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but stops when `cancel` fires.
    ///
    /// On cancellation no further calls are issued and in-flight calls are
    /// dropped; the records captured so far are returned, still ordered by
    /// call id, and may be fewer than `item.call_count`.
    #[tracing::instrument(
        skip_all,
        fields(model = %item.model.name, prompt = %item.prompt_label, calls = item.call_count, concurrency = concurrency_limit)
    )]
    pub async fn run_until_cancelled(
        &self,
        item: &WorkItem,
        concurrency_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<CallRecord>> {
        Self::validate(item, concurrency_limit)?;

        let call_count = item.call_count as usize;
        let workers = concurrency_limit.min(call_count);
        let slots: Arc<Mutex<Vec<Option<CallRecord>>>> = Arc::new(Mutex::new((0..call_count).map(|_| None).collect()));
        let next_index = Arc::new(AtomicUsize::new(0));
        let item = Arc::new(item.clone());

        tracing::debug!(workers, "Starting dispatch workers");

        let mut join_set = JoinSet::new();
        for worker in 0..workers {
            let invoker = self.invoker.clone();
            let slots = slots.clone();
            let next_index = next_index.clone();
            let item = item.clone();
            let cancel = cancel.clone();
            let calls_in_flight = self.calls_in_flight.clone();
            let call_timeout = self.config.call_timeout;

            join_set.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let index = next_index.fetch_add(1, Ordering::SeqCst);
                    if index >= call_count {
                        break;
                    }
                    let call_id = (index + 1) as CallId;

                    let record = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            tracing::debug!(worker, call_id, "Call cancelled in flight");
                            break;
                        }
                        record = issue_call(invoker.as_ref(), &item, call_id, call_timeout, &calls_in_flight) => record,
                    };

                    slots.lock()[index] = Some(record);
                }
            });
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Dispatch worker failed");
            }
        }

        let records: Vec<CallRecord> = slots.lock().drain(..).flatten().collect();

        if records.len() < call_count {
            tracing::warn!(
                captured = records.len(),
                expected = call_count,
                "Dispatch ended early, returning partial records"
            );
        }

        Ok(records)
    }
}

/// Issue a single call and turn whatever happens into a record.
async fn issue_call<I: CallInvoker>(
    invoker: &I,
    item: &WorkItem,
    call_id: CallId,
    call_timeout: Duration,
    calls_in_flight: &Arc<AtomicUsize>,
) -> CallRecord {
    let request = CallRequest {
        call_id,
        model: &item.model,
        prompt: &item.prompt,
    };

    calls_in_flight.fetch_add(1, Ordering::Relaxed);
    gauge!("volley_calls_in_flight").increment(1.0);
    let _guard = scopeguard::guard(calls_in_flight.clone(), |calls_in_flight| {
        calls_in_flight.fetch_sub(1, Ordering::Relaxed);
        gauge!("volley_calls_in_flight").decrement(1.0);
    });

    let started = Instant::now();
    let invocation = match tokio::time::timeout(call_timeout, AssertUnwindSafe(invoker.invoke(&request)).catch_unwind()).await {
        Ok(Ok(invocation)) => invocation,
        Ok(Err(panic)) => Invocation::failed(
            started.elapsed(),
            CallFailure::Panicked {
                message: panic_message(panic.as_ref()),
            },
        ),
        Err(_) => Invocation::failed(started.elapsed(), CallFailure::deadline_exceeded(call_timeout)),
    };

    let record = into_record(call_id, invocation);

    counter!("volley_calls_total", "model" => item.model.name.clone(), "outcome" => record.outcome_label()).increment(1);
    histogram!("volley_call_duration_seconds", "model" => item.model.name.clone()).record(record.response_time().as_secs_f64());

    match record.error_kind() {
        None => tracing::debug!(
            call_id,
            response_time_ms = record.response_time().as_millis() as u64,
            input_tokens = record.input_tokens(),
            output_tokens = record.output_tokens(),
            "Call succeeded"
        ),
        Some(kind) => tracing::warn!(
            call_id,
            error_kind = %kind,
            error = record.error_message().unwrap_or_default(),
            "Call failed"
        ),
    }

    record
}

fn into_record(call_id: CallId, invocation: Invocation) -> CallRecord {
    match invocation.outcome {
        Ok(text) => CallRecord::succeeded(call_id, invocation.response_time, invocation.input_tokens, invocation.output_tokens, text),
        Err(failure) => CallRecord::failed(
            call_id,
            invocation.response_time,
            invocation.input_tokens,
            invocation.output_tokens,
            classify(&failure),
            failure.to_string(),
        ),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
