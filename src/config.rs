//! Command line and runner settings.

use crate::identity::{DEFAULT_AGENT_SOCKET, ENDPOINT_SOCKET_ENV};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

/// Address the server listens on and the client dials by default.
pub const DEFAULT_ADDRESS: &str = "localhost:8443";

/// Environment variable overriding the network address.
pub const ADDRESS_ENV: &str = "SPIFFE_DEMO_ADDRESS";

/// Identity the client expects from the server by default.
pub const DEFAULT_SERVER_ID: &str = "spiffe://example.org/server";

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings of the server role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Workload API endpoint.
    pub socket: String,
    /// Listen address.
    pub address: String,
    /// Client identities to accept; empty accepts any verified client.
    pub allow: Vec<String>,
    /// How long in-flight connections may finish after shutdown starts.
    pub grace_period: Duration,
    /// Upper bound on a single TLS handshake.
    pub handshake_timeout: Duration,
    /// How long to wait for the first identity document.
    pub ready_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            socket: DEFAULT_AGENT_SOCKET.to_owned(),
            address: DEFAULT_ADDRESS.to_owned(),
            allow: Vec::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Settings of the client role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Workload API endpoint.
    pub socket: String,
    /// Server address.
    pub address: String,
    /// Identity the server must present.
    pub server_id: String,
    /// Upper bound on the TLS handshake.
    pub handshake_timeout: Duration,
    /// How long to wait for the first identity document.
    pub ready_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            socket: DEFAULT_AGENT_SOCKET.to_owned(),
            address: DEFAULT_ADDRESS.to_owned(),
            server_id: DEFAULT_SERVER_ID.to_owned(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// spiffe-mtls-demo: a server and a client that authenticate each other with
/// SPIFFE X.509 identities.
#[derive(Parser, Debug)]
#[command(name = "spiffe-mtls-demo", version, about)]
pub struct Cli {
    /// Role to run.
    #[command(subcommand)]
    pub role: Role,
}

/// The two roles of the demo.
#[derive(Subcommand, Debug)]
pub enum Role {
    /// Serve greetings to authenticated clients.
    Server(ServerArgs),
    /// Request one greeting from the server.
    Client(ClientArgs),
}

/// Options shared by both roles.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Workload API endpoint (unix:// or tcp:// URI).
    #[arg(long, env = ENDPOINT_SOCKET_ENV, default_value = DEFAULT_AGENT_SOCKET)]
    pub socket: String,

    /// Network address to listen on or dial.
    #[arg(long, env = ADDRESS_ENV, default_value = DEFAULT_ADDRESS)]
    pub address: String,

    /// Seconds to wait for the first identity document.
    #[arg(long, default_value_t = DEFAULT_READY_TIMEOUT.as_secs())]
    pub ready_timeout_secs: u64,

    /// Seconds a TLS handshake may take.
    #[arg(long, default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_secs())]
    pub handshake_timeout_secs: u64,
}

/// Server options.
#[derive(Args, Debug)]
pub struct ServerArgs {
    #[command(flatten)]
    pub(crate) common: CommonArgs,

    /// Accept only this client identity (repeatable). Any verified client is
    /// accepted when omitted.
    #[arg(long = "allow", value_name = "ID")]
    pub allow: Vec<String>,

    /// Seconds in-flight connections get to finish on shutdown.
    #[arg(long, default_value_t = DEFAULT_GRACE_PERIOD.as_secs())]
    pub grace_period_secs: u64,
}

/// Client options.
#[derive(Args, Debug)]
pub struct ClientArgs {
    #[command(flatten)]
    pub(crate) common: CommonArgs,

    /// Identity the server must present.
    #[arg(long, default_value = DEFAULT_SERVER_ID)]
    pub server_id: String,
}

impl From<ServerArgs> for ServerSettings {
    fn from(args: ServerArgs) -> Self {
        Self {
            socket: args.common.socket,
            address: args.common.address,
            allow: args.allow,
            grace_period: Duration::from_secs(args.grace_period_secs),
            handshake_timeout: Duration::from_secs(args.common.handshake_timeout_secs),
            ready_timeout: Duration::from_secs(args.common.ready_timeout_secs),
        }
    }
}

impl From<ClientArgs> for ClientSettings {
    fn from(args: ClientArgs) -> Self {
        Self {
            socket: args.common.socket,
            address: args.common.address,
            server_id: args.server_id,
            handshake_timeout: Duration::from_secs(args.common.handshake_timeout_secs),
            ready_timeout: Duration::from_secs(args.common.ready_timeout_secs),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use clap::CommandFactory as _;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn missing_role_is_usage_error() {
        let err = Cli::try_parse_from(["spiffe-mtls-demo"]).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::MissingSubcommand | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        ));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn unknown_role_is_usage_error() {
        let err = Cli::try_parse_from(["spiffe-mtls-demo", "proxy"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn server_defaults_and_allow_list() {
        let cli = Cli::try_parse_from([
            "spiffe-mtls-demo",
            "server",
            "--socket",
            "unix:///run/agent.sock",
            "--allow",
            "spiffe://example.org/a",
            "--allow",
            "spiffe://example.org/b",
        ])
        .unwrap();
        let Role::Server(args) = cli.role else {
            panic!("expected server role");
        };

        let settings = ServerSettings::from(args);
        assert_eq!(settings.socket, "unix:///run/agent.sock");
        assert_eq!(
            settings.allow,
            ["spiffe://example.org/a", "spiffe://example.org/b"]
        );
        assert_eq!(settings.grace_period, DEFAULT_GRACE_PERIOD);
        assert_eq!(settings.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(settings.ready_timeout, DEFAULT_READY_TIMEOUT);
    }

    #[test]
    fn client_options() {
        let cli = Cli::try_parse_from([
            "spiffe-mtls-demo",
            "client",
            "--address",
            "127.0.0.1:9443",
            "--server-id",
            "spiffe://example.org/api",
            "--ready-timeout-secs",
            "3",
        ])
        .unwrap();
        let Role::Client(args) = cli.role else {
            panic!("expected client role");
        };

        let settings = ClientSettings::from(args);
        assert_eq!(settings.address, "127.0.0.1:9443");
        assert_eq!(settings.server_id, "spiffe://example.org/api");
        assert_eq!(settings.ready_timeout, Duration::from_secs(3));
    }
}
