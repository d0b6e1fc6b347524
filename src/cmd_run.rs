//! `run` and `pool` subcommand handlers.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use futures::StreamExt;
use tracing::{info, warn};

use kernelhive_config::Config;
use kernelhive_core::{EngineRegistry, KernelManager, PoolStats};
use kernelhive_engine_script::ScriptEngineFactory;
use kernelhive_protocols::{CreateKernelOptions, KernelMode, StreamEvent, StreamName};

use crate::cli::OutputFormat;

/// Engines shipped with the binary.
pub(crate) fn builtin_engines() -> anyhow::Result<EngineRegistry> {
    let engines = EngineRegistry::new().with(Arc::new(ScriptEngineFactory::new()))?;
    Ok(engines)
}

/// Execute one file in a fresh kernel and print its event stream.
pub(crate) async fn run_file(
    config: Config,
    file: &Path,
    mode: Option<KernelMode>,
    language: Option<String>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let manager = KernelManager::new(config, builtin_engines()?);
    let mut options = CreateKernelOptions::new();
    options.mode = mode;
    options.language = language;

    let id = manager.create_kernel(options).await?;
    info!(kernel_id = %id, file = %file.display(), "Running file");

    let mut stream = manager.execute_stream(&id, &code, None).await?;
    let mut failed = None;
    while let Some(event) = stream.next().await {
        if let StreamEvent::ExecuteError(error) = &event {
            failed = Some(error.to_string());
        }
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&event)?),
            OutputFormat::Text => print_event(&event),
        }
    }

    manager.shutdown().await;
    if let Some(error) = failed {
        bail!("execution failed: {}", error);
    }
    Ok(())
}

fn print_event(event: &StreamEvent) {
    match event {
        StreamEvent::Stream(out) => match out.name {
            StreamName::Stdout => print!("{}", out.text),
            StreamName::Stderr => eprint!("{}", out.text),
        },
        StreamEvent::ExecuteResult(result) => {
            let text = result.data.plain_text().unwrap_or("<non-text result>");
            println!("Out[{}]: {}", result.execution_count, text);
        }
        StreamEvent::ExecuteError(error) => {
            for line in &error.traceback {
                eprintln!("  {}", line);
            }
            eprintln!("{}", error);
        }
        StreamEvent::DisplayData(display) | StreamEvent::UpdateDisplayData(display) => {
            let mimes: Vec<&str> = display.data.mime_types().collect();
            match display.data.plain_text() {
                Some(text) => println!("[display] {}", text),
                None => println!("[display] {}", mimes.join(", ")),
            }
        }
        StreamEvent::KernelInfo(reply) => {
            println!(
                "[kernel] {} {} ({})",
                reply.implementation, reply.implementation_version, reply.mode
            );
        }
    }
}

/// Preload the pool, wait for it to fill, and print its counters.
pub(crate) async fn show_pool(
    config: Config,
    wait: Duration,
    format: OutputFormat,
) -> anyhow::Result<()> {
    if config.pool.preload.is_empty() {
        warn!("No pool keys configured under [pool].preload");
    }

    let manager = KernelManager::new(config, builtin_engines()?);
    manager.initialize_pool();

    let deadline = Instant::now() + wait;
    let stats = loop {
        let stats = manager.get_pool_stats();
        let filled = stats.values().all(|s: &PoolStats| s.available >= s.total);
        if filled || Instant::now() >= deadline {
            break stats;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => {
            if stats.is_empty() {
                println!("Pool is empty.");
            } else {
                println!("{:<32} {:>10} {:>8}", "KEY", "AVAILABLE", "TOTAL");
                println!("{}", "-".repeat(52));
                for (key, s) in &stats {
                    println!("{:<32} {:>10} {:>8}", key, s.available, s.total);
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
