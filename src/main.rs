use std::net::SocketAddr;

use anyhow::{Context, Result};
use auth::Verifier;
use clap::Parser;
use config::{Config, GameConfig, DEFAULT_LOG_FILTER};
use coordinator::Coordinator;
use log::info;

mod auth;
mod broadcast;
mod config;
mod connection;
mod coordinator;
mod error;
mod game;
mod outbox;
mod protocol;
mod ready;
mod registry;

mod handler;

#[derive(Clone)]
pub struct GlobalState {
    coordinator: Coordinator,
    verifier: Option<Verifier>,
}

impl GlobalState {
    pub fn new(config: GameConfig, auth_url: Option<&str>) -> Self {
        Self {
            coordinator: Coordinator::new(config),
            verifier: auth_url.map(Verifier::new),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(DEFAULT_LOG_FILTER))
        .init();

    let config = Config::parse();
    let state = GlobalState::new(config.game()?, config.auth_url());
    match config.auth_url() {
        Some(url) => info!("verifying players against {url}"),
        None => info!("verification disabled, every player is a guest"),
    }

    let addr = SocketAddr::new(config.host, config.port);
    let (addr, server) = warp::serve(handler::routes(state))
        .try_bind_with_graceful_shutdown(addr, async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down");
        })
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr}");
    server.await;
    Ok(())
}
