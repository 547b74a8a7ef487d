use std::{net::IpAddr, time::Duration};

use anyhow::{ensure, Result};
use clap::Parser;

/// `RUST_LOG` fallback: this crate at `info`, dependencies at their defaults.
pub const DEFAULT_LOG_FILTER: &str = "typerace_server=info";

/// Real-time typing race server.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Config {
    /// Address to bind to
    #[clap(short = 'H', long, env = "TYPERACE_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    /// Port to listen on
    #[clap(short, long, env = "TYPERACE_PORT", default_value = "9000")]
    pub port: u16,
    /// Endpoint that verifies bearer credentials
    #[clap(
        long,
        env = "TYPERACE_AUTH_URL",
        default_value = "http://127.0.0.1:8000/auth/verify"
    )]
    pub auth_url: String,
    /// Treat every player as a guest without calling the verifier
    #[clap(long)]
    pub no_auth: bool,
    /// Words per race text
    #[clap(long, env = "TYPERACE_RACE_WORDS", default_value = "20")]
    pub race_words: usize,
    /// Seconds the others get after the first player finishes
    #[clap(long, env = "TYPERACE_FINISH_COUNTDOWN", default_value = "20")]
    pub finish_countdown_secs: u64,
    /// Outbound messages buffered per player before they are dropped
    #[clap(long, env = "TYPERACE_QUEUE_CAPACITY", default_value = "256")]
    pub queue_capacity: usize,
}

/// Knobs the coordinator reads.
#[derive(Debug, Clone)]
pub struct GameConfig {
    pub race_words: usize,
    pub finish_countdown: Duration,
    pub queue_capacity: usize,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            race_words: 20,
            finish_countdown: Duration::from_secs(20),
            queue_capacity: 256,
        }
    }
}

impl Config {
    pub fn game(&self) -> Result<GameConfig> {
        ensure!(self.race_words > 0, "race text needs at least one word");
        ensure!(self.queue_capacity > 0, "queue capacity must be positive");
        Ok(GameConfig {
            race_words: self.race_words,
            finish_countdown: Duration::from_secs(self.finish_countdown_secs),
            queue_capacity: self.queue_capacity,
        })
    }

    pub fn auth_url(&self) -> Option<&str> {
        (!self.no_auth).then_some(self.auth_url.as_str())
    }
}
