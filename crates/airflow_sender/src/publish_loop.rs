//! Fixed-cadence sample → publish loop.

use std::time::{Duration, Instant};

use airflow_core::encode_sample;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{error, info, warn};

use crate::metrics::FlowGauge;
use crate::publish::PublishSink;
use crate::sampler::SampleSource;

/// Counters returned when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    /// Samples the sink accepted
    pub published: u64,
    /// Samples produced but rejected by the sink
    pub dropped: u64,
    /// Cycles that produced no sample
    pub failed: u64,
}

/// Cooperative stop for a running [`PublishLoop`].
///
/// Dropping every handle also stops the loop.
#[derive(Debug, Clone)]
pub struct StopHandle(Sender<()>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.try_send(());
    }
}

pub struct PublishLoop {
    interval: Duration,
    stop_rx: Receiver<()>,
}

impl PublishLoop {
    pub fn new(interval: Duration) -> (Self, StopHandle) {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        (Self { interval, stop_rx }, StopHandle(stop_tx))
    }

    /// Runs cycles until stopped.
    ///
    /// A failed cycle is logged and skipped; it never ends the loop. The wait
    /// between cycles is interruptible, and a cycle already in progress always
    /// finishes before the loop returns.
    pub fn run<S, K>(&self, source: &mut S, sink: &mut K, gauge: Option<&FlowGauge>) -> LoopStats
    where
        S: SampleSource + ?Sized,
        K: PublishSink + ?Sized,
    {
        let mut stats = LoopStats::default();

        loop {
            let cycle_start = Instant::now();
            stats.cycles += 1;
            let cycle = stats.cycles;

            match source.sample() {
                Ok(sample) => match encode_sample(&sample) {
                    Ok(message) => {
                        info!("{message}");
                        match sink.publish(&message) {
                            Ok(()) => stats.published += 1,
                            Err(e) => {
                                warn!(cycle, "publish failed: {e}");
                                stats.dropped += 1;
                            }
                        }
                        if let Some(gauge) = gauge {
                            gauge.set(sample.mass_flow());
                        }
                    }
                    Err(e) => {
                        error!(cycle, "{e}");
                        stats.failed += 1;
                    }
                },
                Err(e) => {
                    warn!(cycle, kind = e.kind(), "sample failed: {e}");
                    stats.failed += 1;
                }
            }

            // Wait out the rest of the interval, waking early on stop
            let wait = self.interval.saturating_sub(cycle_start.elapsed());
            match self.stop_rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!(
            "Loop stopped after {} cycles ({} published, {} dropped, {} failed)",
            stats.cycles, stats.published, stats.dropped, stats.failed
        );
        stats
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
