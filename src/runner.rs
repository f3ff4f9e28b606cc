//! Command-line entry points for running brokers and cores.
//!
//! The external wrapper parses the CLI surface here, turns it into a
//! [`CoreConfig`], and maps errors onto the process exit-code contract.

use std::{process::ExitCode, time::Duration};

use clap::Parser;
use conductor_federation::{
    comms,
    config::{CoreConfig, CoreType},
    Broker,
};

/// Process exit codes.
pub mod exit_code {
    pub const CLEAN: u8 = 0;
    pub const CONFIG: u8 = 1;
    pub const CONNECTION: u8 = 2;
    pub const TIMEOUT: u8 = 3;
    pub const FEDERATION: u8 = 4;
}

#[derive(Debug, Parser)]
#[command(name = "conductor", about = "Co-simulation federation broker")]
pub struct Cli {
    /// Federate or broker name.
    #[arg(long, default_value = "conductor")]
    pub name: String,

    /// Transport: tcp, zmq, ipc, mpi, or test.
    #[arg(long, default_value = "test")]
    pub core_type: String,

    /// Listen/connect address for the broker.
    #[arg(long)]
    pub broker: Option<String>,

    /// Expected child count for a broker.
    #[arg(long, default_value_t = 1)]
    pub federates: usize,

    /// Connection and shutdown timeout in seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Verbosity, 0 (off) through 7 (trace).
    #[arg(long, default_value_t = 3)]
    pub log_level: u8,
}

impl Cli {
    pub fn into_config(self) -> Result<CoreConfig, String> {
        if self.log_level > 7 {
            return Err(format!("log level {} is out of range 0..=7", self.log_level));
        }
        let core_type: CoreType = self.core_type.parse()?;
        Ok(CoreConfig {
            name: self.name,
            core_type,
            broker: self.broker,
            federates: self.federates,
            timeout: Duration::from_secs(self.timeout),
            log_level: self.log_level,
        })
    }
}

fn log_filter(level: u8) -> &'static str {
    match level {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 | 5 => "debug",
        _ => "trace",
    }
}

pub fn init_logging(level: u8) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_filter(level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run a root broker on the configured transport until the process is told
/// to stop.
pub async fn run_broker(config: CoreConfig) -> anyhow::Result<()> {
    let broker = Broker::new(&config.name);
    match config.core_type {
        CoreType::Tcp => {
            let addr = config
                .broker
                .clone()
                .unwrap_or_else(|| "127.0.0.1:23405".to_owned());
            let listener = tokio::time::timeout(
                config.timeout,
                tokio::net::TcpListener::bind(&addr),
            )
            .await??;
            tracing::info!(%addr, federation = config.name, "Broker listening.");
            comms::tcp::serve(broker, listener).await;
            Ok(())
        }
        CoreType::Test => {
            tracing::info!(federation = config.name, "In-process broker ready.");
            tokio::signal::ctrl_c().await?;
            Ok(())
        }
        other => anyhow::bail!("core type `{other}` has no transport adapter in this build"),
    }
}

fn classify(err: &anyhow::Error) -> u8 {
    use conductor_federation::coordinator::CoordinationError;
    if err.downcast_ref::<std::io::Error>().is_some() {
        exit_code::CONNECTION
    } else if err.downcast_ref::<tokio::time::error::Elapsed>().is_some()
        || matches!(
            err.downcast_ref::<CoordinationError>(),
            Some(CoordinationError::GrantTimeout { .. })
        )
    {
        exit_code::TIMEOUT
    } else {
        exit_code::FEDERATION
    }
}

/// Parse the command line, run a broker, and exit with the documented codes.
pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(exit_code::CONFIG);
        }
    };
    init_logging(config.log_level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start the runtime: {err}");
            return ExitCode::from(exit_code::CONNECTION);
        }
    };
    match runtime.block_on(run_broker(config)) {
        Ok(()) => ExitCode::from(exit_code::CLEAN),
        Err(err) => {
            tracing::error!(%err, "Broker exited with an error.");
            ExitCode::from(classify(&err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_maps_onto_core_config() {
        let cli = Cli::parse_from([
            "conductor",
            "--name",
            "fed_broker",
            "--core-type",
            "tcp",
            "--broker",
            "127.0.0.1:24000",
            "--federates",
            "3",
            "--timeout",
            "10",
            "--log-level",
            "5",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.name, "fed_broker");
        assert_eq!(config.core_type, CoreType::Tcp);
        assert_eq!(config.broker.as_deref(), Some("127.0.0.1:24000"));
        assert_eq!(config.federates, 3);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.log_level, 5);
    }

    #[test]
    fn bad_configuration_is_rejected() {
        let cli = Cli::parse_from(["conductor", "--core-type", "telepathy"]);
        assert!(cli.into_config().is_err());

        let cli = Cli::parse_from(["conductor", "--log-level", "9"]);
        assert!(cli.into_config().is_err());
    }
}
