//! CLI smoke entry point.
//!
//! # Responsibility
//! - Bootstrap the shared store in a container directory and print its health
//!   report as JSON.
//! - With `--demo`, save one medication and reconcile it against an in-memory
//!   remote.

use healthsync_core::{
    core_version, default_log_level, init_logging, HealthMonitor, InMemoryRemote, Medication,
    MutationService, ProcessMemoryProbe, ReconciliationEngine, Record, RecordBody, ScheduleSlot,
    StoreConfig, StoreHandle,
};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

const DEMO_OWNER: &str = "demo-user";

#[tokio::main]
async fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(container_dir) = args.next().map(PathBuf::from) else {
        eprintln!("usage: healthsync_cli <container_dir> [--demo]");
        return ExitCode::from(2);
    };
    let demo = args.any(|arg| arg == "--demo");

    println!("healthsync_core version={}", core_version());
    match run(container_dir, demo).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_run module=cli status=error error={}", err);
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(container_dir: PathBuf, demo: bool) -> Result<(), Box<dyn std::error::Error>> {
    let container_dir = std::path::absolute(&container_dir)?;
    init_logging(default_log_level(), &container_dir.join("logs"))?;

    let config = StoreConfig::for_container(&container_dir);
    config.validate()?;
    let store = Arc::new(StoreHandle::new(&config));
    let availability = store.initialize().await;
    info!(
        "event=cli_run module=cli status=ok available={}",
        availability.is_available()
    );

    if demo {
        let mutations = MutationService::new(Arc::clone(&store));
        let slots = [ScheduleSlot::at(8, 0), ScheduleSlot::at(20, 0)]
            .into_iter()
            .flatten()
            .collect();
        let saved = mutations
            .save(Record::new(
                DEMO_OWNER,
                RecordBody::Medication(Medication {
                    name: "Metformin".to_string(),
                    dosage: "500mg".to_string(),
                    instructions: Some("with food".to_string()),
                    slots,
                }),
            ))
            .await?;
        println!("saved medication id={}", saved.id);

        let engine = ReconciliationEngine::new(
            Arc::clone(&store),
            Arc::new(InMemoryRemote::new()),
            &config,
        );
        let report = engine.reconcile(DEMO_OWNER).await?;
        println!(
            "reconcile scanned={} pushed={} failures={}",
            report.scanned,
            report.pushed,
            report.failures.len()
        );
        if let Some(err) = report.first_error() {
            return Err(err.into());
        }
    }

    let monitor = HealthMonitor::new(Arc::clone(&store), Arc::new(ProcessMemoryProbe::new()));
    let report = monitor.report().await;
    println!("health={}", report.classification());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
