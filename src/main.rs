use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use primenet_client::adapters::inbound::{FileEventStore, FileSnapshotStore};
use primenet_client::adapters::outbound::{
    init_buffered_journal, init_combined_journal, init_console_journal, HttpTransport, SimulatedKernel, WorktodoFile,
};
use primenet_client::application::{CoordinatorParts, Engine, EngineHandle, EngineParts, EngineSettings};
use primenet_client::domains::diagnostics::DiagnosticReport;
use primenet_client::domains::journal::DynJournal;
use primenet_client::domains::primenet::ManualWorkSource;
use primenet_client::domains::status::StatusSnapshot;
use primenet_client::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "primenet-client", version, about = "Distributed prime search worker")]
struct Cli {
    /// TOML configuration file; PRIMENET__SECTION__KEY variables override it.
    #[arg(short, long, env = "PRIMENET_CONFIG")]
    config: Option<PathBuf>,

    /// Start with communication switched off.
    #[arg(long)]
    manual: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Drain the work queue until interrupted (default).
    Run,
    /// Run the hardware self-test and exit non-zero on instability.
    Torture,
    /// Measure iteration times across FFT sizes and worker counts.
    Benchmark,
    /// Print the restored state as JSON and exit.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if cli.manual {
        config.primenet.manual_mode = true;
    }

    // fast_log must claim the `log` facade before tracing-subscriber tries to.
    let journal = build_journal(&config);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let command = cli.command.unwrap_or(Command::Run);
    let autostart = matches!(command, Command::Run);
    let engine = Engine::bootstrap(build_parts(&config, journal, autostart)?).await?;

    match command {
        Command::Status => {
            let snapshot = engine.status(chrono::Utc::now());
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Command::Run => {
            let handle = engine.handle();
            let task = tokio::spawn(engine.run());
            tokio::signal::ctrl_c().await?;
            info!("interrupt received");
            handle.shutdown().await?;
            task.await??;
            Ok(())
        }
        Command::Torture => {
            let handle = engine.handle();
            let task = tokio::spawn(engine.run());
            let passed = run_diagnostic(&handle, true).await?;
            handle.shutdown().await?;
            task.await??;
            if !passed {
                anyhow::bail!("torture test found hardware instability");
            }
            Ok(())
        }
        Command::Benchmark => {
            let handle = engine.handle();
            let task = tokio::spawn(engine.run());
            run_diagnostic(&handle, false).await?;
            handle.shutdown().await?;
            task.await??;
            Ok(())
        }
    }
}

fn build_journal(config: &Config) -> DynJournal {
    let sink = match &config.journal.path {
        Some(path) => init_combined_journal(&path.to_string_lossy(), config.journal.echo_console),
        None => init_console_journal(),
    };
    if config.journal.buffer_capacity > 0 {
        init_buffered_journal(sink, config.journal.buffer_capacity)
    } else {
        sink
    }
}

fn build_parts(config: &Config, journal: DynJournal, autostart: bool) -> Result<EngineParts> {
    let hardware = config.hardware_profile();
    let demand = config.demand(&hardware);
    let schedule = config.schedule()?;
    let coordinator_settings = config.coordinator_settings();
    let credentials = config.credentials();

    let transport = HttpTransport::new(
        &config.primenet.endpoint,
        credentials.clone(),
        config.primenet.proxy.as_deref(),
        coordinator_settings.request_timeout,
    )
    .map_err(|e| anyhow::anyhow!("building PrimeNet transport: {e}"))?;
    let manual_source = config
        .primenet
        .worktodo_path
        .as_ref()
        .map(|path| Arc::new(WorktodoFile::new(path)) as Arc<dyn ManualWorkSource>);

    let data_dir = &config.storage.data_dir;
    info!(
        cores = hardware.physical_cores,
        threads_per_core = hardware.threads_per_core,
        data_dir = %data_dir.display(),
        "configuration loaded"
    );

    Ok(EngineParts {
        settings: EngineSettings {
            tick_interval: Duration::from_millis(config.supervisor.tick_ms),
            sync_interval: Duration::from_secs(config.primenet.sync_interval_secs),
            max_retries: config.supervisor.max_retries,
            snapshot_frequency: config.storage.snapshot_frequency,
            autostart,
            ..EngineSettings::default()
        },
        hardware,
        demand,
        schedule,
        supervisor: config.supervisor_settings(),
        kernel: Arc::new(SimulatedKernel::new(config.kernel_settings())),
        coordinator: CoordinatorParts {
            settings: coordinator_settings,
            endpoint: config.primenet.endpoint.clone(),
            credentials,
            proxy: config.primenet.proxy.clone(),
            transport: Arc::new(transport),
            manual_source,
            manual_mode: config.primenet.manual_mode,
        },
        event_store: Arc::new(FileEventStore::new(data_dir.join("events"))),
        snapshot_store: Arc::new(FileSnapshotStore::new(data_dir.join("snapshots"))),
        journal,
    })
}

/// Start a torture or benchmark run and wait for its report.
/// Returns whether the run passed; benchmarks always pass unless aborted.
async fn run_diagnostic(handle: &EngineHandle, torture: bool) -> Result<bool> {
    let before = handle.snapshot();
    let reply = if torture {
        handle.run_torture(None).await?
    } else {
        handle.run_benchmark(None).await?
    };
    if let primenet_client::application::CommandReply::Rejected(reason) = reply {
        anyhow::bail!("diagnostic run rejected: {reason}");
    }

    let finished = |s: &StatusSnapshot| {
        if torture {
            s.last_torture != before.last_torture && s.last_torture.is_some()
        } else {
            s.last_benchmark != before.last_benchmark && s.last_benchmark.is_some()
        }
    };
    let snapshot = tokio::select! {
        snapshot = handle.wait_for(finished) => snapshot?,
        _ = tokio::signal::ctrl_c() => {
            error!("interrupted; aborting diagnostics");
            return Ok(false);
        }
    };

    let report = if torture {
        snapshot.last_torture.map(DiagnosticReport::Torture)
    } else {
        snapshot.last_benchmark.map(DiagnosticReport::Benchmark)
    };
    let passed = match &report {
        Some(DiagnosticReport::Torture(r)) => r.passed(),
        Some(DiagnosticReport::Benchmark(r)) => !r.aborted,
        None => false,
    };
    if let Some(report) = report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(passed)
}
