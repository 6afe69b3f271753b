// src/main.rs
//
// Process entry point: load configuration, start the engine, serve the
// HTTP admin surface, and drain cleanly on Ctrl-C (spec.md §2 "Lifecycle
// Controller").

use std::path::PathBuf;

use modgate::config::EngineConfig;
use modgate::engine::Engine;
use modgate::logging;
use modgate::tlog;

#[tokio::main]
async fn main() {
    let config_path = std::env::var("MODGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("modgate.toml"));
    let config = match EngineConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[main] failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init_file_logging(std::path::Path::new("logs")) {
        eprintln!("[main] failed to start file logging: {}", e);
    }

    tlog!("[main] starting modgate (http :{}, opcua :{})", config.http_port, config.opcua_port);

    let engine = match Engine::start(&config).await {
        Ok(e) => e,
        Err(e) => {
            tlog!("[main] engine failed to start: {}", e);
            std::process::exit(1);
        }
    };

    let router = modgate::http::router(engine.admin.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tlog!("[main] failed to bind http port {}: {}", config.http_port, e);
            engine.shutdown().await;
            std::process::exit(1);
        }
    };

    tlog!("[main] http admin surface listening on {}", addr);

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tlog!("[main] http server error: {}", e);
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tlog!("[main] failed to install ctrl-c handler: {}", e);
    }

    tlog!("[main] shutdown requested");
    server.abort();
    engine.shutdown().await;
    logging::stop_file_logging();
}
