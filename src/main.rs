/// flowgate: execution dispatch and resume coordinator
///
/// Main entry point for the flowgate server. Initializes configuration and starts
/// the HTTP server with execution, listener and schedule endpoints.

use flowgate::{config::Config, project::InMemoryProjectCatalog, server::start_server, ProgramRegistry};
use std::sync::Arc;

/// Application entry point
///
/// The server provides:
/// - Execution triggers and logs at /execution/*
/// - Run records at /runs/*
/// - Listener activation at /listeners/*
/// - Schedule publishing at /schedules/*
/// - Health check at /healthz
///
/// Compiled programs are registered by embedders; the standalone binary starts
/// with an empty registry and is meant for remote execution mode.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3004, local execution, data/)
    let config = Config::default();

    start_server(
        config,
        Arc::new(ProgramRegistry::new()),
        Arc::new(InMemoryProjectCatalog::new()),
    )
    .await?;

    Ok(())
}
