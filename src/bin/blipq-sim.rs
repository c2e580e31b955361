//! blipq-sim – drives one queue end to end: producers sending, competing
//! consumers acking, then prints the destination statistics.
//
//  $ blipq-sim --producers 4 --consumers 3 --messages 10000
//  $ BLIPQ_CONFIG=blipq.toml blipq-sim --queue orders --prefetch 50
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use blipq::config::{load_config, load_config_from_env};
use blipq::core::context::{ConnectionContext, ProducerInfo};
use blipq::core::message::{Message, MessageAck};
use blipq::core::queue::{Queue, SendOutcome};
use blipq::core::store::MemoryPersistenceAdapter;
use blipq::core::subscription::{ConsumerInfo, PrefetchSubscription, Subscription};
use blipq::core::task::TokioTaskRunnerFactory;
use blipq::{Config, QueueRegion};

#[derive(Debug, Parser)]
#[command(name = "blipq-sim", version, about = "BlipQ queue delivery simulator")]
struct Cli {
    /// Path to config TOML (env BLIPQ_CONFIG is used when absent)
    #[arg(short, long)]
    config: Option<String>,

    /// Destination to drive
    #[arg(short, long, default_value = "sim")]
    queue: String,

    #[arg(long, default_value_t = 2)]
    producers: usize,

    #[arg(long, default_value_t = 2)]
    consumers: usize,

    /// Messages per producer
    #[arg(short, long, default_value_t = 1000)]
    messages: usize,

    #[arg(long, default_value_t = 10)]
    prefetch: usize,

    #[arg(long, default_value_t = 128)]
    payload_bytes: usize,

    /// Send non-persistent messages
    #[arg(long)]
    transient: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    blipq::logging::init_logging().context("failed to install tracing subscriber")?;
    let cli = Cli::parse();

    let config: Config = match &cli.config {
        Some(path) => load_config(path).with_context(|| format!("loading {path}"))?,
        None => load_config_from_env()?,
    };

    let region = QueueRegion::new(config)
        .with_task_runners(Arc::new(TokioTaskRunnerFactory::current()?))
        .with_persistence(Arc::new(MemoryPersistenceAdapter::new()));
    let queue = region.get_or_create(&cli.queue)?;

    let total = cli.producers * cli.messages;
    let started = Instant::now();

    let consumers: Vec<JoinHandle<anyhow::Result<usize>>> = (0..cli.consumers)
        .map(|n| {
            let queue = queue.clone();
            let prefetch = cli.prefetch;
            tokio::spawn(async move { consume(queue, n, prefetch, total).await })
        })
        .collect();

    let producers: Vec<JoinHandle<anyhow::Result<usize>>> = (0..cli.producers)
        .map(|n| {
            let queue = queue.clone();
            let (count, size, transient) = (cli.messages, cli.payload_bytes, cli.transient);
            tokio::spawn(async move { produce(queue, n, count, size, transient).await })
        })
        .collect();

    let mut sent = 0;
    for result in join_all(producers).await {
        sent += result??;
    }
    info!(sent, "all producers finished");

    let mut received = 0;
    for result in join_all(consumers).await {
        received += result??;
    }

    let elapsed = started.elapsed();
    info!(
        sent,
        received,
        elapsed_ms = elapsed.as_millis() as u64,
        rate = (received as f64 / elapsed.as_secs_f64()) as u64,
        "simulation complete"
    );

    let stats = queue.stats();
    println!("[{}]", queue.name());
    print!("{}", toml::to_string(&stats)?);
    if !stats.is_balanced() {
        warn!(queue = queue.name(), "statistics do not balance");
    }

    region.stop_all();
    Ok(())
}

async fn produce(
    queue: Arc<Queue>,
    n: usize,
    count: usize,
    payload_bytes: usize,
    transient: bool,
) -> anyhow::Result<usize> {
    let context = ConnectionContext::new(format!("producer-{n}"));
    let producer = ProducerInfo::new(format!("producer-{n}"));
    let payload = vec![b'x'; payload_bytes];

    let mut sent = 0;
    for _ in 0..count {
        let mut message = Message::new(payload.clone());
        if transient {
            message = message.non_persistent();
        }
        match queue.send(&context, &producer, message).await? {
            SendOutcome::Accepted(_) => sent += 1,
            SendOutcome::Deferred(receipt) => {
                receipt.wait().await?;
                sent += 1;
            }
            SendOutcome::Expired => {}
        }
    }
    Ok(sent)
}

/// Receive and ack until the queue has dequeued `total` messages overall.
async fn consume(queue: Arc<Queue>, n: usize, prefetch: usize, total: usize) -> anyhow::Result<usize> {
    let context = ConnectionContext::new(format!("consumer-{n}"));
    let (sub, rx) = PrefetchSubscription::new(ConsumerInfo::new(format!("consumer-{n}"), prefetch));
    queue.add_subscription(&context, sub.clone())?;

    let mut received = 0;
    loop {
        if queue.stats().dequeues as usize >= total {
            break;
        }
        let delivery = match tokio::time::timeout(Duration::from_millis(200), rx.recv_async()).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => break,
            Err(_) => continue,
        };
        let ack = MessageAck::individual(queue.name(), delivery.consumer_id.clone(), delivery.message_id);
        sub.acknowledge(&context, &queue, &ack)?;
        received += 1;
    }

    queue.remove_subscription(&context, &sub.info().consumer_id, None)?;
    Ok(received)
}
