// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `weft`: starts a worker pool, keeps the delay wheel turning and runs the
//! periodic dispatch workload for a fixed time, then shuts down cleanly and
//! prints the pool report.

mod dispatch;

use anyhow::{Context, Result};
use clap::Parser;
use dispatch::Dispatcher;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use weft_core::RuntimeConfig;
use weft_tasks::{RotationDriver, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "weft", version, about = "Cooperative task scheduler runtime")]
struct Cli {
    /// Runtime configuration file (TOML)
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Worker threads, overriding the configuration file (0 = one per CPU)
    #[arg(long = "threads")]
    threads: Option<u32>,

    /// How long to run the dispatch workload before shutting down
    #[arg(long = "run-for-ms", default_value_t = 1000)]
    run_for_ms: u64,

    /// Also write the pool report as JSON to this file
    #[arg(long = "report")]
    report: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if let Some(threads) = cli.threads {
        config.thread_count = threads;
    }
    config.validate().context("Invalid runtime configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    log::info!("Starting weft with {config:?}");

    let mut pool = WorkerPool::new(&config).context("Failed to start the worker pool")?;
    let mut driver = RotationDriver::new(
        Arc::clone(pool.scheduler()),
        Duration::from_micros(config.rotate_interval_us),
    );
    driver.start().context("Failed to start the rotation driver")?;

    let dispatcher = Dispatcher::new(Duration::from_micros(config.dispatch_interval_us));
    pool.scheduler()
        .add_task(dispatcher.task(), &[])
        .context("Failed to submit the dispatch task")?;

    let started = Instant::now();
    thread::sleep(Duration::from_millis(cli.run_for_ms));

    pool.shutdown();
    pool.exit_fence().wait();
    driver.stop();
    let report = pool.finish_shutdown();
    let elapsed = started.elapsed();

    let stats = dispatcher.stats();
    println!(
        "{} dispatch ticks, {} recordings, {} submits in {elapsed:.2?} on {} workers ({} tasks)",
        stats.ticks.load(Ordering::Relaxed),
        stats.records.load(Ordering::Relaxed),
        stats.submits.load(Ordering::Relaxed),
        report.workers,
        report.timers.tasks_executed,
    );
    for (label, time) in report.task_times.sorted() {
        println!(
            "  {label:<12} {:>8} runs, avg {:?}, max {:?}",
            time.count,
            time.average(),
            time.max
        );
    }

    if let Some(path) = &cli.report {
        let json = report.to_json().context("Failed to serialize the report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        log::info!("Report written to {}", path.display());
    }
    Ok(())
}
