//! entrain: rhythm-tapping experiment runner

mod config;
mod terminal;

use anyhow::Context;
use entrain_services::{
    AnalysisBridge, Allocator, DevicePair, ExperimentController, OnsetAnalyzer, OutputStore, SessionError,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("entrain=debug".parse().unwrap())
            .add_directive("entrain_core=debug".parse().unwrap())
            .add_directive("entrain_services=debug".parse().unwrap()))
        .init();

    let path = config::config_path();
    let config = config::load_config(&path).with_context(|| format!("reading {}", path.display()))?;
    tracing::info!(config = %path.display(), output = %config.output_dir.display(), "Starting entrain");

    let Some(pid) = terminal::prompt_participant_id()? else {
        return Ok(());
    };

    let store = OutputStore::new(&config.output_dir);
    let resuming = store.has_allocation(&pid);
    if resuming {
        let missing = store.missing_trials(&pid)?;
        println!("Participant {pid} already has data; {} trials missing:", missing.len());
        for trial in &missing {
            println!("  {trial}");
        }
        if missing.is_empty() {
            return Ok(());
        }
    }

    // Wrong sample rate or missing channels stop here, before any trial
    let device = DevicePair::open(&config.devices.device_config()).context("opening audio devices")?;

    let (mut controller, handle) = ExperimentController::new(
        device,
        config.devices.channel_map(),
        AnalysisBridge::new(Box::new(OnsetAnalyzer::default())),
        store.clone(),
        Allocator::new(store),
        config.session.session_config(),
    );

    println!("{}", terminal::KEY_HELP);
    let printer = terminal::spawn_event_printer(handle.events().clone());
    terminal::spawn_command_reader(handle);

    let outcome = if resuming { controller.resume(&pid) } else { controller.run_session(&pid) };
    // closes the event channel so the printer drains and exits
    drop(controller);
    let _ = printer.join();

    match outcome {
        Ok(_) | Err(SessionError::Aborted) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
