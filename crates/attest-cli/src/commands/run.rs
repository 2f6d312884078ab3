use std::path::PathBuf;

use anyhow::Context;
use tracing::{info, warn};

use attest_core::config::{EnvSnapshot, HarnessConfig};
use attest_harness::launcher::LaunchMode;
use attest_harness::report::ReportGenerator;
use attest_harness::runner::{HarnessRunner, RunOptions};

pub struct RunArgs {
    pub config: PathBuf,
    pub parallel: bool,
    pub perf: bool,
    pub target: Option<String>,
    pub concurrency: usize,
    pub out: Option<PathBuf>,
    pub json: bool,
}

pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let config = HarnessConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let specs = config.resolve()?;
    info!(services = specs.len(), config = %args.config.display(), "configuration loaded");

    let runner = HarnessRunner::new(specs, EnvSnapshot::capture(), config.settle_delay());
    let launcher = runner.launcher();

    let options = RunOptions {
        mode: if args.parallel {
            LaunchMode::Parallel
        } else {
            LaunchMode::Sequential
        },
        include_performance: args.perf,
        integration_target: args.target,
        concurrency: args.concurrency,
    };

    // Workers are stopped on every exit path, including Ctrl-C and a fatal
    // launch error.
    let outcome = tokio::select! {
        outcome = runner.run(&options) => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    launcher.shutdown().await;

    let run = match outcome {
        Some(outcome) => outcome?,
        None => anyhow::bail!("interrupted; workers stopped"),
    };

    let report = ReportGenerator::generate(run.suites)?;
    let rendered = if args.json {
        serde_json::to_string_pretty(&report)?
    } else {
        ReportGenerator::render(&report)
    };
    match &args.out {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{rendered}"),
    }

    if run.required_failures > 0 {
        warn!(
            failures = run.required_failures,
            "required services have failing checks"
        );
        Ok(1)
    } else {
        Ok(0)
    }
}
