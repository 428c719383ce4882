//! # Development Cache Server
//!
//! Runs the in-memory RESP2 server so the dialog app and admin console can be
//! developed without a hosted Valkey instance.
//!
//! Environment:
//! - `TELLI_CACHE_ADDR` listen address (default `127.0.0.1:6379`)
//! - `TELLI_CACHE_EXPIRE_INTERVAL_MS` TTL sweep interval (default 100)
//! - `RUST_LOG` log filter (default `info`)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use telli_cache_engine::MemoryEngine;

const DEFAULT_ADDR: &str = "127.0.0.1:6379";
const DEFAULT_EXPIRE_INTERVAL_MS: u64 = 100;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = env::var("TELLI_CACHE_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let interval_ms = match env::var("TELLI_CACHE_EXPIRE_INTERVAL_MS") {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("invalid TELLI_CACHE_EXPIRE_INTERVAL_MS: {raw}"))?,
        Err(_) => DEFAULT_EXPIRE_INTERVAL_MS,
    };

    let engine = Arc::new(MemoryEngine::new());
    let expirer = engine.start_expirer(Duration::from_millis(interval_ms));

    let (listener, local) = telli_cache_server::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%local, interval_ms, "telli cache server listening");

    tokio::select! {
        result = telli_cache_server::serve(listener, Arc::clone(&engine)) => {
            result.context("accept loop failed")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
        }
    }

    expirer.stop();
    info!("telli cache server stopped");
    Ok(())
}
