//! CLI command definitions

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Exercise the tether protocol between two in-process endpoints", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Channel connecting the sender and the receiver
    #[arg(long, value_enum, env = "TETHER_TRANSPORT", default_value = "port", global = true)]
    pub transport: TransportChoice,

    /// Request timeout in milliseconds
    #[arg(long, env = "TETHER_TIMEOUT_MS", default_value_t = 10_000, global = true)]
    pub timeout_ms: u64,

    /// Batch flush delay in milliseconds
    #[arg(long, env = "TETHER_BATCH_DELAY_MS", default_value_t = 1, global = true)]
    pub batch_delay_ms: u64,

    /// Batch size that forces an immediate flush
    #[arg(long, env = "TETHER_MAX_BATCH", default_value_t = 10, global = true)]
    pub max_batch: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportChoice {
    /// Entangled message ports
    Port,
    /// Two instances of a named broadcast channel
    Broadcast,
    /// One window-like target shared by both endpoints
    Shared,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send ping requests and print round-trip times
    Ping {
        /// Number of pings
        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },

    /// Fire concurrent requests and report throughput
    ///
    /// Examples:
    ///   tether bench --requests 10000
    ///   tether bench --transport broadcast --max-batch 50
    Bench {
        /// Number of requests
        #[arg(short = 'n', long, default_value_t = 1000)]
        requests: usize,
    },

    /// Subscribe to a ticking event stream, then unsubscribe
    Watch {
        /// Events to print before unsubscribing
        #[arg(short, long, default_value_t = 5)]
        events: usize,

        /// Tick interval in milliseconds
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },
}
