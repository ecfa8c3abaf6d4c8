//! # Airflow Sender
//!
//! Polls a mass-flow controller over a serial line, publishes every reading as
//! a JSON message and exposes the latest mass flow as a Prometheus gauge.
//!
//! ## Usage
//! ```bash
//! airflow_sender                                # config.toml next to the binary
//! airflow_sender --config /etc/airflow.toml
//! airflow_sender --device /dev/ttyUSB0 --site glbrc --no-wake
//! ```

mod backoff;
mod metrics;
mod publish;
mod publish_loop;
mod sampler;
mod session;

#[cfg(test)]
mod fake;

use std::path::PathBuf;

use airflow_core::config::AppConfig;
use airflow_core::{SessionMode, Transport};
use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use backoff::{connect_with_retry, RetryPolicy};
use metrics::{FlowGauge, MetricsServer};
use publish_loop::PublishLoop;
use sampler::{DeviceSampler, SerialConnector};
use session::DeviceSession;

#[derive(Parser, Debug)]
#[command(name = "airflow_sender")]
#[command(about = "Publishes mass-flow controller readings as JSON")]
struct Args {
    /// Path to config.toml (default: next to the executable)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial device path
    #[arg(long)]
    device: Option<String>,

    /// Site identifier stamped on every sample
    #[arg(long)]
    site: Option<String>,

    /// Controller query address
    #[arg(long)]
    address: Option<String>,

    /// Sampling interval in seconds
    #[arg(long)]
    interval: Option<f64>,

    /// Skip the wake sequence at startup
    #[arg(long)]
    no_wake: bool,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(device) = &self.device {
            config.device.path = device.clone();
        }
        if let Some(site) = &self.site {
            config.site = site.clone();
        }
        if let Some(address) = &self.address {
            config.device.address = address.clone();
        }
        if let Some(interval) = self.interval {
            config.sampler.interval_secs = interval;
        }
        if self.no_wake {
            config.device.wake = false;
        }
    }
}

fn main() -> Result<()> {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    // ── Load config ──
    let config_path = args.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&config_path);

    // Write the defaults out if no file exists yet
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Could not save default config: {e}");
        }
    }

    args.apply(&mut config);

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("config: {e}");
        }
        bail!("invalid configuration ({} problems)", errors.len());
    }

    // ── Device ──
    let endpoint = config.device.endpoint();
    let retry = RetryPolicy::from(&config.startup);
    let mut session = connect_with_retry(&retry, || DeviceSession::open(&endpoint))
        .with_context(|| format!("cannot open {}", endpoint.path))?;

    if config.device.wake {
        if let Err(e) = session.wake() {
            warn!("Wake sequence failed: {e}");
        }
    }

    let sampler = DeviceSampler::new(
        SerialConnector,
        endpoint.clone(),
        config.site.clone(),
        config.device.number_policy,
        config.device.session,
    )
    .with_session(session);

    // ── Async runtime (ZeroMQ socket, metrics, Ctrl-C) ──
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("cannot start async runtime")?;

    // ── Publish sink ──
    let sink = publish::from_config(&config.publish, runtime.handle())
        .context("cannot start publisher")?;

    // ── Metrics ──
    let gauge = config.metrics.enabled.then(FlowGauge::new);
    let metrics_server = match &gauge {
        Some(gauge) => Some(
            runtime
                .block_on(MetricsServer::bind(&config.metrics, gauge.clone()))
                .with_context(|| format!("cannot bind metrics on {}", config.metrics.listen_addr))?,
        ),
        None => None,
    };

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   AIRFLOW SENDER – ACTIVE");
    println!("══════════════════════════════════════════════");
    println!("  Device:    {} @ {} baud", endpoint.path, endpoint.baud_rate);
    println!("  Address:   {}", endpoint.address);
    println!("  Site:      {}", config.site);
    println!("  Interval:  {:.1}s", config.sampler.interval_secs);
    println!(
        "  Publish:   {}",
        match config.publish.transport {
            Transport::Zmq => format!("zmq PUB {}", config.publish.zmq_endpoint),
            Transport::Tcp => format!("tcp lines {}", config.publish.bind_addr),
            Transport::Udp => format!("udp {}", config.publish.dest_addr),
        }
    );
    println!(
        "  Session:   {}",
        match config.device.session {
            SessionMode::Reopen => "reopen per cycle",
            SessionMode::KeepOpen => "keep open",
        }
    );
    println!("══════════════════════════════════════════════");
    println!();

    // ── Sampler thread ──
    let (publish_loop, stop) = PublishLoop::new(config.sampler.interval());
    let loop_gauge = gauge.clone();
    let sampler_thread = std::thread::Builder::new()
        .name("sampler-loop".into())
        .spawn(move || {
            let mut sampler = sampler;
            let mut sink = sink;
            publish_loop.run(&mut sampler, sink.as_mut(), loop_gauge.as_ref())
        })
        .context("cannot spawn sampler thread")?;

    // Metrics run detached; only Ctrl-C stops the sampler
    if let Some(server) = metrics_server {
        runtime.spawn(server.run());
    }

    // ── Wait for Ctrl-C ──
    runtime.block_on(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, stopping"),
            Err(e) => {
                error!("Cannot listen for Ctrl-C: {e}; running until killed");
                std::future::pending::<()>().await;
            }
        }
    });

    stop.stop();
    match sampler_thread.join() {
        Ok(stats) => info!(
            "Exited after {} cycles ({} published, {} dropped, {} failed)",
            stats.cycles, stats.published, stats.dropped, stats.failed
        ),
        Err(_) => bail!("sampler thread panicked"),
    }

    Ok(())
}
