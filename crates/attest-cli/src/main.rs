mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// attest -- launch MCP service workers and verify them end to end.
#[derive(Parser)]
#[command(name = "attest", version, about)]
struct Cli {
    /// Emit logs as JSON lines instead of human-readable output.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full suite chain against the configured services.
    Run {
        /// Path to the service configuration file.
        #[arg(short, long, default_value = "attest.toml")]
        config: PathBuf,

        /// Launch all services concurrently instead of one at a time.
        #[arg(long)]
        parallel: bool,

        /// Include the concurrent performance suite.
        #[arg(long)]
        perf: bool,

        /// Service to exercise end to end in the integration suite.
        #[arg(long)]
        target: Option<String>,

        /// Simultaneous calls in the performance burst.
        #[arg(long, default_value_t = 5)]
        concurrency: usize,

        /// Write the report to this file instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Emit the report as JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Parse and validate a configuration file without launching anything.
    Validate {
        /// Path to the service configuration file.
        #[arg(short, long, default_value = "attest.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.log_json {
        attest_telemetry::logging::init_logging_json("info");
    } else {
        attest_telemetry::logging::init_logging("info");
    }

    let outcome = match cli.command {
        Commands::Run {
            config,
            parallel,
            perf,
            target,
            concurrency,
            out,
            json,
        } => {
            commands::run::run(commands::run::RunArgs {
                config,
                parallel,
                perf,
                target,
                concurrency,
                out,
                json,
            })
            .await
        }
        Commands::Validate { config } => commands::validate::run(&config),
    };

    // Exit codes: 0 all good, 1 required-service test failures, 2 fatal
    // (configuration or required-service launch errors).
    match outcome {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    }
}
