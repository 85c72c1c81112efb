//! Router configuration.
//!
//! Flags mirror the historical `-l` / `-t` interface; every option can also
//! be supplied through an `IPERF_LB_*` environment variable.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Result};
use clap::{Parser, ValueEnum};

use crate::proxy::{ListenerConfig, DEFAULT_BACKEND_HOST};
use crate::session::DEFAULT_PORT_FLOOR;
use crate::supervisor::{BackendConfig, DEFAULT_READINESS_MARKER, PORT_PLACEHOLDER};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// iperf-lb - pins every iperf3 test to its own backend server.
#[derive(Debug, Clone, Parser)]
#[command(name = "iperf-lb")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address to accept iperf3 clients on.
    #[arg(short = 'l', long, env = "IPERF_LB_LISTEN", default_value = "[::]:5201")]
    pub listen: SocketAddr,

    /// Backend connect timeout in milliseconds.
    #[arg(short = 't', long, env = "IPERF_LB_DIAL_TIMEOUT_MS", default_value_t = 1500)]
    pub dial_timeout_ms: u64,

    /// Time a client gets to send its handshake token, in milliseconds.
    #[arg(long, env = "IPERF_LB_HANDSHAKE_TIMEOUT_MS", default_value_t = 10_000)]
    pub handshake_timeout_ms: u64,

    /// Handshake token length in bytes (37 for the iperf3 cookie).
    #[arg(long, env = "IPERF_LB_TOKEN_LEN", default_value_t = 37)]
    pub token_len: usize,

    /// Lowest port handed to a backend.
    #[arg(long, env = "IPERF_LB_PORT_FLOOR", default_value_t = DEFAULT_PORT_FLOOR)]
    pub port_floor: u16,

    /// Host backends are dialed on.
    #[arg(long, env = "IPERF_LB_BACKEND_HOST", default_value = DEFAULT_BACKEND_HOST)]
    pub backend_host: String,

    /// Backend program.
    #[arg(long, env = "IPERF_LB_BACKEND_PROGRAM", default_value = "iperf3")]
    pub backend_program: String,

    /// Backend argument; repeat for several. `{port}` is replaced by the
    /// allocated port.
    #[arg(
        long = "backend-arg",
        allow_hyphen_values = true,
        default_values = ["-s", "-1", "-p", "{port}"]
    )]
    pub backend_args: Vec<String>,

    /// Output marking a backend as ready.
    #[arg(long, env = "IPERF_LB_READINESS_MARKER", default_value = DEFAULT_READINESS_MARKER)]
    pub readiness_marker: String,

    /// Time a backend gets to print its readiness marker, in milliseconds.
    #[arg(long, env = "IPERF_LB_READINESS_TIMEOUT_MS", default_value_t = 10_000)]
    pub readiness_timeout_ms: u64,

    /// Serve /metrics and /sessions over HTTP.
    #[arg(long, env = "IPERF_LB_METRICS")]
    pub metrics: bool,

    /// Address of the metrics endpoint.
    #[arg(long, env = "IPERF_LB_METRICS_LISTEN", default_value = "[::]:9100")]
    pub metrics_listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "IPERF_LB_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "IPERF_LB_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    /// Reject settings the router cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.token_len > 0, "token length must be at least 1 byte");
        ensure!(
            !self.readiness_marker.is_empty(),
            "readiness marker must not be empty"
        );
        ensure!(
            !self.backend_program.is_empty(),
            "backend program must not be empty"
        );
        ensure!(
            self.backend_args.iter().any(|a| a.contains(PORT_PLACEHOLDER)),
            "backend arguments must contain {} so each backend gets its own port",
            PORT_PLACEHOLDER
        );
        ensure!(self.dial_timeout_ms > 0, "dial timeout must be positive");
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            bind_addr: self.listen,
            token_len: self.token_len,
            handshake_timeout: self.handshake_timeout(),
            dial_timeout: self.dial_timeout(),
        }
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            program: self.backend_program.clone(),
            args: self.backend_args.clone(),
            readiness_marker: self.readiness_marker.clone(),
            readiness_timeout: Duration::from_millis(self.readiness_timeout_ms),
        }
    }
}
