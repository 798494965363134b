use clap::{Parser, Subcommand};
use kafka_pipeline::broker::{BrokerClient, MemoryBroker};
use kafka_pipeline::consumer::{Delivery, LoggingHandler};
use kafka_pipeline::kafka::{KafkaBroker, KafkaConsumer, SerializationFormat};
use kafka_pipeline::{Config, ConsumerPipeline, OutgoingMessage, ProducerPipeline, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "kafka-pipeline")]
#[command(about = "Kafka producer and consumer pipelines", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, global = true, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, global = true, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, global = true, help = "Use an in-memory broker instead of Kafka")]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a payload through the producer pipeline
    Produce {
        /// JSON document, or plain text sent as-is
        #[arg(short, long)]
        payload: String,

        #[arg(short, long)]
        key: Option<String>,

        /// Extra header as KEY=VALUE, repeatable
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Send this many copies as one batch
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Run the consumer pipeline until interrupted
    Consume {
        /// Overrides the configured consumer topic
        #[arg(short, long)]
        topic: Option<String>,

        #[arg(long)]
        from_beginning: bool,
    },
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting kafka-pipeline");
    info!("Loading configuration from {:?}", args.config);

    let mut config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        kafka_brokers = ?config.kafka.brokers,
        producer_topic = %config.producer.topic,
        consumer_group = %config.consumer.group_id,
        dry_run = args.dry_run,
        "Configuration summary"
    );

    let result = match args.command {
        Command::Produce {
            payload,
            key,
            headers,
            count,
        } => produce(&config, args.dry_run, payload, key, headers, count).await,
        Command::Consume {
            topic,
            from_beginning,
        } => {
            if topic.is_some() {
                config.consumer.topic = topic;
            }
            config.consumer.from_beginning |= from_beginning;
            consume(&config, args.dry_run).await
        }
    };

    if let Err(e) = &result {
        error!("kafka-pipeline failed: {}", e);
    }
    result
}

async fn produce(
    config: &Config,
    dry_run: bool,
    raw_payload: String,
    key: Option<String>,
    headers: Vec<(String, String)>,
    count: usize,
) -> Result<()> {
    let memory = dry_run.then(|| Arc::new(MemoryBroker::new()));
    let broker: Arc<dyn BrokerClient> = match &memory {
        Some(memory) => memory.clone(),
        None => Arc::new(KafkaBroker::new(&config.kafka, &config.producer)?),
    };
    broker.connect().await?;

    let (payload, format) = match serde_json::from_str::<Value>(&raw_payload) {
        Ok(value) => (value, SerializationFormat::Json),
        Err(_) => (Value::String(raw_payload), SerializationFormat::String),
    };
    let pipeline = ProducerPipeline::new(Arc::clone(&broker), config.producer.clone())
        .with_serializer(format.serializer());

    let mut message = OutgoingMessage::new(payload);
    if let Some(key) = key {
        message = message.with_key(key);
    }
    for (name, value) in headers {
        message = message.with_header(name, value);
    }

    let sent = if count > 1 {
        pipeline
            .send_batch(vec![message; count])
            .await
            .map(|report| {
                info!(
                    topic = %report.topic,
                    messages = report.message_count,
                    chunks = ?report.chunk_sizes,
                    "Batch delivered"
                );
            })
    } else {
        pipeline.send_message(message).await.map(|receipt| {
            info!(
                topic = %receipt.topic,
                partition = ?receipt.partition,
                message_id = %receipt.metadata.message_id,
                correlation_id = %receipt.metadata.correlation_id,
                "Message delivered"
            );
        })
    };

    broker.disconnect().await?;
    sent?;

    if let Some(memory) = memory {
        for batch in memory.sent() {
            info!(topic = %batch.topic, records = batch.records.len(), "Dry run recorded send");
        }
    }
    Ok(())
}

async fn consume(config: &Config, dry_run: bool) -> Result<()> {
    let mut pipeline = ConsumerPipeline::new(LoggingHandler, &config.consumer)?;
    spawn_signal_handler(pipeline.shutdown_token());

    let topic = config.consumer_topic();
    if dry_run {
        info!("Dry run: reading one payload per line from stdin");
        return consume_stdin(&mut pipeline, topic).await;
    }

    let consumer = KafkaConsumer::new(&config.kafka, &config.consumer)?;
    consumer.subscribe(topic)?;
    consumer.run(&mut pipeline).await
}

async fn consume_stdin(pipeline: &mut ConsumerPipeline<LoggingHandler>, topic: &str) -> Result<()> {
    let shutdown = pipeline.shutdown_token();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut offset = 0i64;

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        let delivery = Delivery::new(topic, 0, offset, Some(line.as_bytes()));
        match pipeline.process(delivery).await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => warn!("No redelivery in dry run: {}", e),
            Err(e) => return Err(e),
        }
        offset += 1;
    }

    pipeline.log_final_metrics();
    Ok(())
}

/// First signal cancels `token`; a second one exits immediately.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            warn!("Failed to listen for shutdown signals: {}", e);
            return;
        }
        info!("Shutdown signal received, stopping after the current message");
        token.cancel();

        if wait_for_signal().await.is_ok() {
            warn!("Second shutdown signal received, exiting immediately");
            std::process::exit(1);
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("kafka_pipeline=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("kafka_pipeline=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
