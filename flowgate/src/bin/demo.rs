//! flowgate-demo: run one parallel stage over a list of numbers.
//!
//! Each item sleeps `item * delay_ms` and is doubled, so completion order
//! differs from input order whenever later items are smaller.
//!
//! ```text
//! flowgate-demo --concurrency 2 --items 4,3,2,1 --ordered
//! flowgate-demo --config stage.json --items 1,2,3,4 --fail-on 3
//! ```

use anyhow::{Context, Result, bail};
use clap::Parser;
use flowgate::{
    BoxError, FnTask, FlowgateError, LoggingOptions, ParallelStage, StageConfig, init_logging,
};
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Parser, Debug)]
#[command(name = "flowgate-demo", about = "Run a bounded-concurrency stage over numbers")]
struct Args {
    /// Stage config as JSON (overrides --concurrency/--ordered/--name).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum task units in flight.
    #[arg(short, long, default_value_t = 2)]
    concurrency: usize,

    /// Emit results in input order.
    #[arg(long)]
    ordered: bool,

    #[arg(long, default_value = "double")]
    name: String,

    /// Comma-separated input items.
    #[arg(long, value_delimiter = ',', default_value = "1,2,3,4")]
    items: Vec<u64>,

    /// Milliseconds of simulated work per unit of item value.
    #[arg(long, default_value_t = 10)]
    delay_ms: u64,

    /// Make the task fail on this item.
    #[arg(long)]
    fail_on: Option<u64>,

    /// Skip odd items instead of emitting them.
    #[arg(long)]
    skip_odd: bool,

    /// Write logs to a daily rolling file in this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Args {
    fn stage_config(&self) -> Result<StageConfig> {
        let config = match &self.config {
            Some(path) => StageConfig::from_json_file(path)?,
            None => {
                let config = StageConfig::new(self.concurrency).with_name(&self.name);
                let config = if self.ordered {
                    config.with_delivery(flowgate::Delivery::Ordered)
                } else {
                    config
                };
                config.validate()?;
                config
            }
        };
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&LoggingOptions {
        log_dir: args.log_dir.clone(),
        ..Default::default()
    })?;

    let config = args.stage_config().context("invalid stage configuration")?;
    tracing::info!(?config, items = args.items.len(), "starting demo");

    let delay_ms = args.delay_ms;
    let fail_on = args.fail_on;
    let skip_odd = args.skip_odd;
    let task = FnTask::filter_map(config.name.clone(), move |x: u64| async move {
        tokio::time::sleep(Duration::from_millis(x * delay_ms)).await;
        if fail_on == Some(x) {
            return Err(BoxError::from(format!("refusing to process item {}", x)));
        }
        if skip_odd && x % 2 == 1 {
            return Ok(None);
        }
        Ok(Some(x * 2))
    });

    let stage = ParallelStage::new(config, task)?;

    // Feed the stage through a channel, as a real producer would.
    let (tx, rx) = mpsc::channel(1);
    let items = args.items.clone();
    let producer = tokio::spawn(async move {
        for item in items {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    let (mut results, handle) = stage.process(ReceiverStream::new(rx));
    let mut failure: Option<FlowgateError> = None;

    while let Some(result) = results.next().await {
        match result {
            Ok(value) => println!("{}", value),
            Err(e) => {
                eprintln!("error: {}", e);
                failure.get_or_insert(e);
            }
        }
    }
    drop(results);

    producer.await.context("producer task failed")?;

    let outcome = handle.completion().await;
    let report = json!({
        "outcome": outcome,
        "metrics": handle.metrics(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(e) = failure {
        bail!(e);
    }
    Ok(())
}
