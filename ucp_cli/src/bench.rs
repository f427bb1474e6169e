//! Ping-pong benchmark over the in-process loopback engine.

use crate::error::CliError;
use libucp::{ApplicationContext, ConfigMap, Endpoint, ProgressMode};
use log::*;
use rand::Rng;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub struct BenchOptions {
    pub size: usize,
    pub iterations: usize,
    pub mode: ProgressMode,
    pub options: ConfigMap,
    pub env_precedence: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct BenchReport {
    pub size: usize,
    pub iterations: usize,
    pub progress_mode: String,
    pub total_ms: f64,
    pub round_trip_us: f64,
    pub bandwidth_mib_s: f64,
}

impl BenchReport {
    fn new(opts: &BenchOptions, mode: ProgressMode, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let iterations = opts.iterations.max(1) as f64;
        // Every round trip moves the payload twice.
        let bytes = 2.0 * opts.size as f64 * opts.iterations as f64;
        let bandwidth = if secs > 0.0 { bytes / secs / (1024.0 * 1024.0) } else { 0.0 };
        Self {
            size: opts.size,
            iterations: opts.iterations,
            progress_mode: mode.to_string(),
            total_ms: secs * 1e3,
            round_trip_us: secs * 1e6 / iterations,
            bandwidth_mib_s: bandwidth,
        }
    }
}

impl Display for BenchReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Message size    : {} bytes", self.size)?;
        writeln!(f, "Round trips     : {}", self.iterations)?;
        writeln!(f, "Progress mode   : {}", self.progress_mode)?;
        writeln!(f, "Total time      : {:.3} ms", self.total_ms)?;
        writeln!(f, "Round trip      : {:.3} us", self.round_trip_us)?;
        write!(f, "Bandwidth       : {:.2} MiB/s", self.bandwidth_mib_s)
    }
}

/// Echoes `iterations` messages of `size` bytes back to the sender.
async fn echo(ep: Endpoint, size: usize, iterations: usize) -> Result<(), libucp::UcpError> {
    let mut buf = vec![0u8; size];
    for _ in 0..iterations {
        ep.recv(&mut buf, None).await?;
        ep.send(&buf, None).await?;
    }
    Ok(())
}

async fn ping_pong(ctx: &ApplicationContext, opts: &BenchOptions) -> Result<Duration, CliError> {
    let (size, iterations) = (opts.size, opts.iterations);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let listener = ctx.create_listener(
        move |ep| {
            let done = done_tx.clone();
            async move {
                let result = echo(ep, size, iterations).await;
                if let Err(err) = &result {
                    warn!("Echo handler failed. {err}");
                }
                done.send(result.is_ok()).ok();
            }
        },
        None,
    )?;
    let port = listener.port()?;
    let client = ctx.create_endpoint("127.0.0.1", port).await?;
    info!("Benchmark connection established on port {port}");

    let mut payload = vec![0u8; size];
    rand::rng().fill(&mut payload[..]);
    let mut echoed = vec![0u8; size];
    let start = Instant::now();
    for i in 0..iterations {
        client.send(&payload, None).await?;
        client.recv(&mut echoed, None).await?;
        if echoed != payload {
            return Err(CliError::Bench(format!("Echoed payload differs from the original on round trip {i}")));
        }
    }
    let elapsed = start.elapsed();

    client.close();
    listener.close();
    match done_rx.recv().await {
        Some(true) => Ok(elapsed),
        _ => Err(CliError::Bench("The echo handler did not finish cleanly".into())),
    }
}

/// Runs the benchmark on a freshly initialized global context, and resets it afterwards.
pub async fn run_bench(opts: BenchOptions) -> Result<BenchReport, CliError> {
    libucp::set_progress_mode(opts.mode)?;
    libucp::init(opts.options.clone(), opts.env_precedence)?;
    let ctx = libucp::get_or_create()?;
    let mode = ctx.progress_mode();
    debug!("Running {} round trips of {} bytes in {mode} mode", opts.iterations, opts.size);
    let result = match mode {
        ProgressMode::Manual => drive_manually(&ctx, ping_pong(&ctx, &opts)).await,
        _ => ping_pong(&ctx, &opts).await,
    };
    drop(ctx);
    let reset = libucp::reset();
    let elapsed = result?;
    reset?;
    Ok(BenchReport::new(&opts, mode, elapsed))
}

/// Interleaves `fut` with explicit progress calls, for contexts without a progress task.
async fn drive_manually<F: std::future::Future>(ctx: &ApplicationContext, fut: F) -> F::Output {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            out = &mut fut => return out,
            _ = tokio::task::yield_now() => {
                ctx.progress();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn options(size: usize, mode: ProgressMode) -> BenchOptions {
        BenchOptions { size, iterations: 20, mode, options: ConfigMap::new(), env_precedence: false }
    }

    #[tokio::test]
    async fn bench_runs_in_every_mode() {
        env_logger::try_init().ok();
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                for mode in [ProgressMode::Auto, ProgressMode::Polling, ProgressMode::Manual] {
                    let report = run_bench(options(10_000, mode)).await.unwrap();
                    assert_eq!(report.iterations, 20);
                    assert_ne!(report.progress_mode, "auto");
                    assert!(!libucp::is_initialized());
                }
            })
            .await;
    }

    #[tokio::test]
    async fn empty_messages_are_fine() {
        let local = tokio::task::LocalSet::new();
        let report = local.run_until(run_bench(options(0, ProgressMode::Auto))).await.unwrap();
        assert_eq!(report.bandwidth_mib_s, 0.0);
        assert!(report.to_string().contains("0 bytes"));
    }
}
