//! Command-line interface for topic-relay
//!
//! Consumes every Kafka topic matching a pattern, parses messages as JSON and
//! writes the resulting records as JSON lines. A message's offset is committed
//! once its records were written.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use topic_relay::consumer::shutdown::cancel_on_signal;
use topic_relay::consumer::{
    kafka_connectors, ChannelSink, ConsumerConfig, JsonParser, Record, SinkHandle, Supervisor,
    TrackedBatch,
};

/// Relay records from pattern-selected Kafka topics
#[derive(Parser, Debug)]
#[command(name = "topic-relay")]
#[command(version)]
#[command(about = "Bounded at-least-once relay from Kafka topics to JSON lines", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Kafka broker addresses (overrides the configuration file)
    #[arg(long, num_args = 1..)]
    brokers: Vec<String>,

    /// Topic selection pattern (regular expression)
    #[arg(short, long)]
    topic: Option<String>,

    /// Consumer group ID
    #[arg(short, long)]
    group: Option<String>,

    /// Topic refresh interval, e.g. "30s"
    #[arg(long)]
    refresh_interval: Option<String>,

    /// Tag name that receives the source topic
    #[arg(long)]
    topic_tag: Option<String>,

    /// Maximum number of undelivered messages
    #[arg(long)]
    max_undelivered: Option<usize>,

    /// Write records to a file instead of stdout
    #[arg(short = 'o', long)]
    output_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable JSON structured logging
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn load_config(&self) -> Result<ConsumerConfig> {
        let mut config = match &self.config {
            Some(path) => ConsumerConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => ConsumerConfig::default(),
        };

        if !self.brokers.is_empty() {
            config.brokers = self.brokers.clone();
        }
        if let Some(topic) = &self.topic {
            config.topics = vec![topic.clone()];
        }
        if let Some(group) = &self.group {
            config.consumer_group = group.clone();
        }
        if let Some(interval) = &self.refresh_interval {
            config.topics_refresh_interval = Some(interval.clone());
        }
        if let Some(tag) = &self.topic_tag {
            config.topic_tag = Some(tag.clone());
        }
        if let Some(max) = self.max_undelivered {
            config.max_undelivered_messages = max;
        }
        Ok(config)
    }

    fn log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(io::stderr),
            )
            .init();
    }
}

fn write_records(writer: &mut dyn Write, records: &[Record]) -> Result<()> {
    for record in records {
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Write every submitted batch as JSON lines and confirm it.
///
/// Writes run on the blocking pool. Returns once the sink was dropped.
async fn write_batches(mut handle: SinkHandle, writer: Box<dyn Write + Send>) {
    let mut writer = Some(writer);
    let mut written: u64 = 0;
    let mut errors_open = true;

    loop {
        tokio::select! {
            batch = handle.batches.recv() => {
                let Some(TrackedBatch { id, records }) = batch else { break };
                let Some(mut out) = writer.take() else {
                    handle.confirm(id, false);
                    continue;
                };

                let count = records.len() as u64;
                let task = tokio::task::spawn_blocking(move || {
                    let result = write_records(&mut *out, &records);
                    (out, result)
                });

                match task.await {
                    Ok((out, Ok(()))) => {
                        writer = Some(out);
                        written += count;
                        handle.confirm(id, true);
                    }
                    Ok((out, Err(e))) => {
                        writer = Some(out);
                        error!(%id, error = %e, "Failed to write records");
                        handle.confirm(id, false);
                    }
                    Err(e) => {
                        error!(%id, error = %e, "Output writer failed, rejecting further batches");
                        handle.confirm(id, false);
                    }
                }
            }
            reported = handle.errors.recv(), if errors_open => match reported {
                Some(reported) => debug!(severity = ?reported.severity, "{}", reported.message),
                None => errors_open = false,
            },
        }
    }

    info!(records = written, "Output closed");
}

fn open_output(path: Option<&PathBuf>) -> Result<Box<dyn Write + Send>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level(), cli.json_logs);

    let config = cli.load_config()?;
    let parser = Arc::new(JsonParser::new(config.parser.clone()));
    let (sink, handle) = ChannelSink::new();
    let output = open_output(cli.output_file.as_ref())?;

    let supervisor = Supervisor::start(&config, kafka_connectors(), parser, Arc::new(sink))
        .await
        .context("Invalid configuration")?;
    info!(
        brokers = %supervisor.settings().bootstrap_servers(),
        group = %supervisor.settings().consumer_group,
        pattern = %supervisor.settings().topic_pattern,
        "Relay started"
    );

    let writer = tokio::spawn(write_batches(handle, output));
    let signals = cancel_on_signal(supervisor.cancellation_token());

    supervisor.wait().await;
    signals.abort();

    let metrics = supervisor.metrics().snapshot();
    match serde_json::to_string(&metrics) {
        Ok(metrics) => info!(%metrics, "Relay stopped"),
        Err(e) => warn!(error = %e, "Relay stopped, failed to render metrics"),
    }

    drop(supervisor);
    if let Err(e) = writer.await {
        warn!(error = %e, "Output task ended abnormally");
    }
    Ok(())
}
