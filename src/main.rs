//! rnsh command-line entry point. One binary, two modes: `-l` serves a
//! command over the overlay; a positional destination hash attaches to one.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rnsh::client::{self, ClientConfig};
use rnsh::config;
use rnsh::listener::{Listener, ListenerConfig};
use rnsh::transport::{destination_hash, AddressHash, Transport};
use rnsh::APP_NAME;

#[derive(Debug, Parser)]
#[command(
    name = "rnsh",
    version,
    about = "Remote shell over an identity-addressed overlay network"
)]
struct Cli {
    /// Alternate config directory to use
    #[arg(long = "config", value_name = "DIR")]
    config: Option<PathBuf>,

    /// Specific identity file to use
    #[arg(short = 'i', long = "identity", value_name = "FILE")]
    identity: Option<PathBuf>,

    /// Listen on/connect to a specific service name
    #[arg(short = 's', long = "service", value_name = "NAME", default_value = "default")]
    service: String,

    /// Print identity information and exit
    #[arg(short = 'p', long = "print-identity")]
    print_identity: bool,

    /// Listen (server) mode
    #[arg(short = 'l', long = "listen")]
    listen: bool,

    /// Do not announce the service
    #[arg(short = 'b', long = "no-announce")]
    no_announce: bool,

    /// Identities allowed to connect
    #[arg(short = 'a', long = "allowed", value_name = "HASH")]
    allowed: Vec<String>,

    /// Disable authentication
    #[arg(short = 'n', long = "no-auth")]
    no_auth: bool,

    /// Disable identify on connect
    #[arg(short = 'N', long = "no-id")]
    no_id: bool,

    /// Return with the code of the remote process
    #[arg(short = 'm', long = "mirror")]
    mirror: bool,

    /// Connect and request timeout in seconds
    #[arg(short = 'w', long = "timeout", value_name = "TIME", default_value_t = 15.0)]
    timeout: f64,

    /// Increase verbosity
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Increase quietness
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    quiet: u8,

    /// Destination hash to connect to
    #[arg(value_name = "DESTINATION_HASH")]
    destination: Option<String>,

    /// Command to serve, after --
    #[arg(last = true, value_name = "PROGRAM")]
    command: Vec<String>,
}

fn init_logging(cli: &Cli) {
    // The listener defaults to info, the client to warn; -v and -q move the
    // level. Logs go to stderr, stdout belongs to the terminal stream.
    let ladder = ["error", "warn", "info", "debug", "trace"];
    let base: i16 = if cli.listen { 2 } else { 1 };
    let level = (base + cli.verbose as i16 - cli.quiet as i16)
        .clamp(0, ladder.len() as i16 - 1) as usize;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rnsh={}", ladder[level])));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    match run(cli).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("rnsh: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config_dir = config::config_dir(cli.config.clone());

    if cli.print_identity {
        let identity = config::load_or_create_identity(&config_dir, cli.identity.as_deref())?;
        println!("Identity     : {identity}");
        if cli.listen {
            let destination = destination_hash(identity.hash(), APP_NAME, &cli.service);
            println!("Listening on : {destination}");
        }
        return Ok(0);
    }

    if cli.listen {
        return listen(&cli, &config_dir).await;
    }

    if let Some(destination) = cli.destination.clone() {
        return initiate(&cli, &config_dir, destination).await;
    }

    bail!("nothing to do: pass --listen with a command, or a destination hash");
}

async fn listen(cli: &Cli, config_dir: &std::path::Path) -> anyhow::Result<i32> {
    if cli.command.is_empty() {
        bail!("listen mode needs a command: rnsh -l ... -- <program> [args]");
    }
    if !cli.no_auth && cli.allowed.is_empty() {
        bail!("listen mode needs --no-auth or at least one --allowed identity hash");
    }
    let allowed = cli
        .allowed
        .iter()
        .map(|hash| AddressHash::from_hex(hash))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("{e}"))?;

    let identity = config::load_or_create_identity(config_dir, cli.identity.as_deref())?;
    let transport_config = config::for_listener(config::load_transport_config(config_dir)?);
    let (transport, events) = Transport::start(&identity, transport_config)
        .await
        .context("could not start transport")?;

    let listener = Listener::new(
        transport,
        ListenerConfig {
            command: cli.command.clone(),
            service_name: cli.service.clone(),
            allow_all: cli.no_auth,
            allowed,
            announce: !cli.no_announce,
        },
    );
    listener.run(events).await;
    Ok(0)
}

async fn initiate(
    cli: &Cli,
    config_dir: &std::path::Path,
    destination: String,
) -> anyhow::Result<i32> {
    let identity = config::load_or_create_identity(config_dir, cli.identity.as_deref())?;
    let transport_config = config::for_client(config::load_transport_config(config_dir)?);
    let (transport, events) = Transport::start(&identity, transport_config)
        .await
        .context("could not start transport")?;

    let outcome = client::run(
        transport.clone(),
        events,
        &identity,
        ClientConfig {
            destination,
            no_id: cli.no_id,
            timeout: Duration::from_secs_f64(cli.timeout.max(0.0)),
        },
    )
    .await;
    transport.shutdown().await;

    match outcome {
        Ok(return_code) => Ok(if cli.mirror { return_code } else { 0 }),
        Err(e) => {
            eprintln!("{}", e.msg);
            Ok(255)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn listener_invocation_parses() {
        let cli = Cli::try_parse_from([
            "rnsh", "-l", "-n", "-s", "shell", "--", "/bin/sh", "-c", "id",
        ])
        .unwrap();
        assert!(cli.listen);
        assert!(cli.no_auth);
        assert_eq!(cli.service, "shell");
        assert_eq!(cli.command, vec!["/bin/sh", "-c", "id"]);
        assert!(cli.destination.is_none());
    }

    #[test]
    fn client_invocation_parses() {
        let hash = "ab".repeat(16);
        let cli = Cli::try_parse_from(["rnsh", "-N", "-m", "-w", "30", &hash]).unwrap();
        assert!(!cli.listen);
        assert!(cli.no_id);
        assert!(cli.mirror);
        assert_eq!(cli.timeout, 30.0);
        assert_eq!(cli.destination.as_deref(), Some(hash.as_str()));
    }

    #[test]
    fn repeated_allowed_hashes_accumulate() {
        let cli = Cli::try_parse_from([
            "rnsh", "-l", "-a", "aa", "-a", "bb", "--", "/bin/sh",
        ])
        .unwrap();
        assert_eq!(cli.allowed, vec!["aa", "bb"]);
    }

    #[test]
    fn verbosity_flags_repeat() {
        let cli = Cli::try_parse_from(["rnsh", "-l", "-n", "-vvv", "-q", "--", "x"]).unwrap();
        assert_eq!(cli.verbose, 3);
        assert_eq!(cli.quiet, 1);
    }
}
