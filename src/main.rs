use std::process::ExitCode;
use topdown::{RunConfig, TopDown, TopDownError};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(config_path), None) = (args.next(), args.next()) else {
        eprintln!("usage: topdown <config.json>");
        return ExitCode::from(1);
    };

    match drive(&config_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "run failed");
            ExitCode::from(exit_code(&error))
        }
    }
}

fn drive(config_path: &str) -> Result<(), TopDownError> {
    let config = RunConfig::from_json_file(config_path.as_ref())?;
    let engine = TopDown::new(config)?;

    // An existing checkpoint means an earlier run got this far already;
    // pick it up instead of starting over.
    let summary = if engine.config().state_file().exists() {
        engine.resume_run()?
    } else {
        engine.run()?
    };
    tracing::info!(
        individuals = summary.individuals,
        nodes = summary.nodes,
        depth = summary.depth,
        "done"
    );
    Ok(())
}

fn exit_code(error: &TopDownError) -> u8 {
    match error {
        TopDownError::Config(_) | TopDownError::Parameter(_) | TopDownError::State(_) => 1,
        TopDownError::Input(_) | TopDownError::Io(_) => 2,
        TopDownError::Infeasible { .. } => 3,
        TopDownError::Solver { .. } => 4,
        TopDownError::Interrupted(_) => 5,
        _ => 1,
    }
}
