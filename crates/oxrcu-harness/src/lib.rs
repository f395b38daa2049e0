//! # oxrcu-harness
//!
//! Stress workload for the RCU library: enqueuers and dequeuers racing
//! on an RCU-protected lock-free queue, dequeued nodes reclaimed
//! through `call_rcu`, with a single-line SUMMARY record (and optional
//! JSON) at the end.

use thiserror::Error;

pub mod lfq;
pub mod runner;

pub use runner::{run, Config, Totals};

/// Harness-level failures. Library-level invariant violations are not
/// errors; they abort inside the library.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("CPU {cpu} out of range (machine has {ncpus})")]
    CpuOutOfRange { cpu: usize, ncpus: usize },
    #[error("this platform cannot enumerate CPUs; -a is unsupported")]
    AffinityUnsupported,
    #[error("a workload thread panicked")]
    WorkerPanicked,
}

/// Render the canonical one-line summary record.
pub fn summary_line(tag: &str, config: &Config, totals: &Totals) -> String {
    format!(
        "SUMMARY {:<25} testdur {:>4} nr_enqueuers {:>3} wdelay {:>6} \
         nr_dequeuers {:>3} rdur {:>6} nr_enqueues {:>12} nr_dequeues {:>12} \
         successful enqueues {:>12} successful dequeues {:>12} \
         end_dequeues {} nr_ops {:>12}",
        tag,
        config.duration_s,
        config.nr_enqueuers,
        config.wdelay,
        config.nr_dequeuers,
        config.rduration,
        totals.nr_enqueues,
        totals.nr_dequeues,
        totals.successful_enqueues,
        totals.successful_dequeues,
        totals.end_dequeues,
        totals.nr_ops(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line_carries_every_counter() {
        let config = Config {
            nr_dequeuers: 4,
            nr_enqueuers: 3,
            duration_s: 5,
            wdelay: 7,
            rduration: 9,
            affinity: Vec::new(),
            verbose: false,
        };
        let totals = Totals {
            nr_enqueues: 100,
            nr_dequeues: 90,
            successful_enqueues: 100,
            successful_dequeues: 80,
            end_dequeues: 20,
        };
        let line = summary_line("lfq-stress", &config, &totals);
        assert!(line.starts_with("SUMMARY lfq-stress"));
        for needle in [
            "testdur    5",
            "nr_enqueuers   3",
            "wdelay      7",
            "nr_dequeuers   4",
            "rdur      9",
            "end_dequeues 20",
        ] {
            assert!(line.contains(needle), "missing `{needle}` in `{line}`");
        }
        assert!(totals.balanced());
    }
}
