use std::process::ExitCode;

use ecu_sim::run;
use ecu_sim::settings::Settings;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load settings: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let app_name = env!("CARGO_PKG_NAME").replace('-', "_");
            let level = settings.logger.level.as_str();

            format!("{app_name}={level},ecu_actuators={level}").into()
        }))
        .init();

    let report = match run(&settings).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Simulation failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let written = report.to_json().and_then(|json| match &settings.simulation.report {
        Some(path) => {
            std::fs::write(path, json)?;
            tracing::info!("Report written to {}", path);
            Ok(())
        }
        None => {
            println!("{json}");
            Ok(())
        }
    });

    match written {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Failed to write report: {}", e);
            ExitCode::FAILURE
        }
    }
}
