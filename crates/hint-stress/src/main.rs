mod events;
mod pipeline;
mod upstream;

use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "hint-stress", about = "Stress test for the Hint telemetry core")]
struct Cli {
    /// Scenario duration in seconds.
    #[arg(short, long, default_value = "30")]
    duration: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Produce batches and stream blocks while the collector flaps.
    Pipeline {
        /// Production interval in ms.
        #[arg(long, default_value = "50")]
        tick: u64,
        /// Collector presence toggle interval in ms.
        #[arg(long, default_value = "3000")]
        flap: u64,
        /// Inject a transient send failure every N ticks (0 = never).
        #[arg(long, default_value = "25")]
        fail_every: u32,
        /// Queue size of both channels.
        #[arg(long, default_value = "16")]
        queue_size: usize,
        /// Samples per stream block.
        #[arg(long, default_value = "400")]
        block_samples: usize,
        /// Statistics report interval in ms.
        #[arg(long, default_value = "1000")]
        report: u64,
    },

    /// Poll a cached upstream that goes down for a while.
    Backoff {
        /// Poll interval in ms.
        #[arg(long, default_value = "250")]
        poll: u64,
        /// Lifetime of a cached answer in ms.
        #[arg(long, default_value = "1000")]
        ttl: u64,
        /// Outage start, in ms after launch.
        #[arg(long, default_value = "3000")]
        outage_start: u64,
        /// Outage length in ms.
        #[arg(long, default_value = "12000")]
        outage: u64,
        /// First backoff window in ms.
        #[arg(long, default_value = "500")]
        backoff_start: u64,
        /// Largest backoff window in ms.
        #[arg(long, default_value = "4000")]
        backoff_max: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let duration = Duration::from_secs(cli.duration);

    eprintln!("hint-stress v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();

    match cli.command {
        Command::Pipeline {
            tick,
            flap,
            fail_every,
            queue_size,
            block_samples,
            report,
        } => {
            pipeline::run(pipeline::PipelineConfig {
                duration,
                tick: Duration::from_millis(tick.max(1)),
                flap: Duration::from_millis(flap.max(1)),
                fail_every,
                queue_size,
                block_samples,
                report: Duration::from_millis(report.max(1)),
            })
            .await?;
        }

        Command::Backoff {
            poll,
            ttl,
            outage_start,
            outage,
            backoff_start,
            backoff_max,
        } => {
            upstream::run(upstream::UpstreamConfig {
                duration,
                poll: Duration::from_millis(poll.max(1)),
                ttl: Duration::from_millis(ttl),
                outage_start: Duration::from_millis(outage_start),
                outage: Duration::from_millis(outage),
                backoff_start: Duration::from_millis(backoff_start),
                backoff_max: Duration::from_millis(backoff_max),
            })
            .await?;
        }
    }

    Ok(())
}
