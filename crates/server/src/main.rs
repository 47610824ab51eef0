//! The racetype real-time coordination engine binary: wires the
//! Authentication Gate, Rate Governor, Connection Registry, Room Fabric,
//! and the two session engines behind a single websocket listener, and
//! drives the shared housekeeping sweep (§5) on its own clock.

mod config;

use crate::config::Args;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use eyre::{eyre, Result};
use mimalloc::MiMalloc;
use racetype_collab::{InMemoryResultSink, StaticFriendGraph, StaticTokenVerifier, StaticWordSource};
use racetype_common::now_ms;
use racetype_governor::RateGovernor;
use racetype_race_engine::RaceEngine;
use racetype_registry::{ConnectionRegistry, RoomFabric};
use racetype_router::ws::ws_upgrade_handler;
use racetype_router::SessionRouter;
use racetype_test_engine::TestEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn mk_router(router: Arc<SessionRouter>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade_handler))
        .with_state(router)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Drives the engines' TTL sweeps, the rate governor's idle-bucket
/// eviction, and room reclamation from one beat (§5), independent of any
/// connection's own traffic.
async fn housekeeping(router: Arc<SessionRouter>, interval_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        ticker.tick().await;
        router.sweep(now_ms());
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let main_subscriber = tracing_subscriber::fmt()
        .compact()
        .with_ansi(true)
        .with_file(true)
        .with_line_number(true)
        .with_thread_names(true)
        .with_max_level(if args.debug { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(main_subscriber).map_err(|e| eyre!("unable to configure logging: {e}"))?;

    let config = args.load().map_err(|e| eyre!("unable to load configuration: {e}"))?;
    config.runtime.validate().map_err(|e| eyre!("invalid configuration: {e}"))?;

    if let Some(path) = &args.write_merged_config {
        let json = serde_json::to_string_pretty(&config)?;
        std::fs::write(path, json)?;
        info!(path = ?path, "wrote merged configuration, exiting");
        return Ok(());
    }

    let rooms = Arc::new(RoomFabric::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let word_source = Arc::new(StaticWordSource::new());
    let result_sink = Arc::new(InMemoryResultSink::new());
    let token_verifier = Arc::new(StaticTokenVerifier::new());
    let friend_graph = Arc::new(StaticFriendGraph::new());

    let test_engine = Arc::new(TestEngine::new(
        Arc::clone(&rooms),
        Arc::clone(&registry),
        Arc::clone(&word_source) as _,
        Arc::clone(&result_sink) as _,
        config.runtime.clone(),
    ));
    let race_engine = Arc::new(RaceEngine::new(
        Arc::clone(&rooms),
        Arc::clone(&registry),
        word_source as _,
        result_sink as _,
        config.runtime.clone(),
    ));
    let governor = Arc::new(RateGovernor::new(config.runtime.rate_governor.clone()));

    let router = Arc::new(SessionRouter::new(
        registry,
        rooms,
        governor,
        test_engine,
        race_engine,
        token_verifier as _,
        friend_graph as _,
        config.runtime.clone(),
    ));

    tokio::spawn(housekeeping(Arc::clone(&router), config.runtime.housekeeping_interval_ms));

    let app = mk_router(router);
    info!(address = %config.listen_address, "listening");
    let listener = TcpListener::bind(config.listen_address).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
