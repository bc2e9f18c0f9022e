use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use volley::{Config, Dispatcher, DispatcherConfig, OpenAiInvoker, Runner, output, telemetry};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::warn!("Received Ctrl+C, stopping benchmark...");
        },
        _ = terminate => {
            tracing::warn!("Received SIGTERM, stopping benchmark...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = volley::config::Args::parse();

    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;
    tracing::debug!("{:?}", args);

    let selection = args.selection();
    let work_items = config.work_items(&selection)?;
    let prompts = config.selected_prompts(&selection)?;
    let pricing = config.pricing_table()?;

    tracing::info!(
        endpoint = %config.endpoint,
        groups = work_items.len(),
        calls_per_group = config.number_of_calls,
        concurrency = config.concurrency,
        model = selection.model.as_deref().unwrap_or("all"),
        prompt = selection.prompt_name.as_deref().or(selection.custom_prompt.as_ref().map(|_| "custom")).unwrap_or("all"),
        "Benchmark configuration"
    );

    let client = reqwest::Client::builder().build()?;
    let invoker = Arc::new(OpenAiInvoker::new(
        client,
        &config.endpoint,
        config.api_key.clone(),
        config.request_timeout,
    ));
    // Backstop above the transport timeout
    let dispatcher_config = DispatcherConfig {
        call_timeout: config.request_timeout + config.request_timeout / 2,
    };
    let dispatcher = Arc::new(Dispatcher::new(invoker, dispatcher_config));
    let runner = Runner::new(dispatcher, pricing, config.concurrency);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    let report = runner.run(&work_items, &cancel).await?;

    if report.groups.is_empty() {
        tracing::warn!("No benchmark results to save");
        return Ok(());
    }

    let run_dir = output::RunWriter::new(&config.output_dir).write(&report, &prompts)?;
    println!("{}", output::render_summary(&report));
    println!("Results saved in: {}", run_dir.display());

    if report.interrupted {
        anyhow::bail!("benchmark interrupted before all groups completed");
    }
    Ok(())
}
