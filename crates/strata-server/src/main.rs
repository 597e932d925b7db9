use std::process::ExitCode;
use std::sync::Arc;
use strata_common::config::Config;
use strata_logger::{log, set_max_level, LogSeverity};
use strata_server::{Pipeline, Server};

#[tokio::main]
async fn main() -> ExitCode {
    log("Strata init".to_owned(), LogSeverity::Info);

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            log(format!("Failed to load configuration: {}", e), LogSeverity::Fatal);
            return ExitCode::FAILURE;
        }
    };
    match config.log_level.parse::<LogSeverity>() {
        Ok(level) => set_max_level(level),
        Err(_) => log(
            format!("Unknown log level {:?}, keeping default", config.log_level),
            LogSeverity::Warning,
        ),
    }

    let bind_addr = config.server.bind_addr.clone();
    let pipeline = match Pipeline::open(config).await {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            log(format!("Failed to open pipeline: {}", e), LogSeverity::Fatal);
            return ExitCode::FAILURE;
        }
    };
    pipeline.start().await;

    let server = match Server::bind(pipeline.clone(), &bind_addr).await {
        Ok(server) => server,
        Err(e) => {
            log(format!("Failed to bind {}: {}", bind_addr, e), LogSeverity::Fatal);
            pipeline.shutdown().await;
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        _ = server.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                log(format!("Failed to listen for Ctrl-C: {}", e), LogSeverity::Error);
            }
            log("Shutting down".to_owned(), LogSeverity::Info);
        }
    }

    pipeline.shutdown().await;
    ExitCode::SUCCESS
}
