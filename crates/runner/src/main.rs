//! Development runner: drives the job engine against in-memory stores.
//!
//! Every positional argument is a work-key. Each gets a record with sample
//! input and an enqueued job; the processor runs until Ctrl-C. Engine settings
//! come from the `GENQ_*` environment variables.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value as JsonValue;

use genq_infra::{
    GenerateError, Generator, InMemoryJobStore, InMemoryRecordStore, JobProcessor,
    ProcessorConfig, WorkRecord,
};

#[derive(Parser, Debug)]
#[clap(version, about = "Run the genq job engine against in-memory stores")]
struct CliArgs {
    /// Work-keys to seed and enqueue.
    pub work_keys: Vec<String>,

    /// Seconds allowed for a graceful stop after Ctrl-C.
    #[clap(long, env = "GENQ_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Seconds between job stats log lines.
    #[clap(long, env = "GENQ_STATS_INTERVAL_SECS", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub stats_interval_secs: u64,

    /// Words kept by the sample generator.
    #[clap(long, default_value_t = 6)]
    pub summary_words: usize,
}

/// Stand-in for a remote model: keeps the first few words of the input.
struct SampleGenerator {
    max_words: usize,
}

#[async_trait::async_trait]
impl Generator for SampleGenerator {
    async fn generate(&self, input_text: &str, _context: &JsonValue) -> Result<String, GenerateError> {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let words: Vec<&str> = input_text.split_whitespace().take(self.max_words).collect();
        if words.is_empty() {
            return Err(GenerateError::Request("nothing to summarize".to_string()));
        }
        Ok(format!("Summary: {}", words.join(" ")))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    genq_observability::init();

    let args = CliArgs::parse();
    let config = ProcessorConfig::from_env().context("invalid GENQ_* configuration")?;
    let work_keys = args.work_keys;
    if work_keys.is_empty() {
        tracing::warn!("no work keys given; processor will idle");
    }

    let store = Arc::new(InMemoryJobStore::new());
    let records = Arc::new(InMemoryRecordStore::new());
    for key in &work_keys {
        records.insert(WorkRecord::new(
            key.as_str(),
            format!("sample transcript for {key} with a few words to summarize"),
        ));
    }

    let processor = JobProcessor::new(
        config,
        store,
        records,
        Arc::new(SampleGenerator {
            max_words: args.summary_words,
        }),
    )?;
    processor.start().await?;

    for key in &work_keys {
        let job = processor.enqueue(key).await?;
        tracing::info!(job_id = %job.id, work_key = %key, "enqueued");
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.stats_interval_secs));
    ticker.tick().await;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for ctrl-c")?;
                break;
            }
            _ = ticker.tick() => {
                let counts = processor.get_stats().await?;
                tracing::info!(
                    pending = counts.pending,
                    processing = counts.processing,
                    completed = counts.completed,
                    failed = counts.failed,
                    runtime = ?processor.runtime_stats(),
                    "job stats"
                );
            }
        }
    }

    processor
        .stop(Duration::from_secs(args.shutdown_timeout_secs))
        .await?;
    Ok(())
}
