//! CLI entrypoint for the RCU lock-free-queue stress workload.

use std::process::ExitCode;

use clap::Parser;

use oxrcu_harness::{run, summary_line, Config};

/// RCU-protected lock-free queue stress test.
#[derive(Debug, Parser)]
#[command(name = "lfq-stress")]
#[command(about = "N dequeuers and M enqueuers race on an RCU-protected queue")]
struct Cli {
    /// Number of dequeuer threads.
    nr_dequeuers: usize,
    /// Number of enqueuer threads.
    nr_enqueuers: usize,
    /// Test duration in seconds.
    duration: u64,
    /// Pin workload threads to this CPU (repeatable; round-robin).
    #[arg(short = 'a', action = clap::ArgAction::Append, value_name = "CPU")]
    affinity: Vec<usize>,
    /// Enqueuer delay between operations, in busy loops.
    #[arg(short = 'd', default_value_t = 0, value_name = "LOOPS")]
    wdelay: u64,
    /// Dequeuer read-side duration per operation, in busy loops.
    #[arg(short = 'c', default_value_t = 0, value_name = "LOOPS")]
    rduration: u64,
    /// Per-thread counters on stderr.
    #[arg(short = 'v')]
    verbose: bool,
    /// Emit the result record as JSON on stdout instead of the
    /// SUMMARY line.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config {
        nr_dequeuers: cli.nr_dequeuers,
        nr_enqueuers: cli.nr_enqueuers,
        duration_s: cli.duration,
        wdelay: cli.wdelay,
        rduration: cli.rduration,
        affinity: cli.affinity,
        verbose: cli.verbose,
    };

    oxrcu_core::rcu_init();

    let totals = match run(&config) {
        Ok(totals) => totals,
        Err(err) => {
            eprintln!("lfq-stress: {err}");
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        match serde_json::to_string(&totals) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("lfq-stress: serializing results: {err}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("{}", summary_line("lfq-stress", &config, &totals));
    }

    if !totals.balanced() {
        eprintln!(
            "lfq-stress: LOST NODES: {} enqueued, {} dequeued + {} drained",
            totals.successful_enqueues, totals.successful_dequeues, totals.end_dequeues
        );
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
