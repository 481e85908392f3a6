use clap::{Parser, ValueEnum};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use ucp::{DEFAULT_PORT, DEFAULT_READ_TIMEOUT, RSA_KEY_BITS};

#[derive(Parser)]
#[command(name = "ucp")]
#[command(about = "Secure point-to-point file copy", long_about = None)]
#[command(version)]
struct Cli {
    /// Server mode: listen for incoming client requests
    #[arg(long)]
    server: bool,

    /// Server mode: host or interface to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server mode: port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Client mode: file to copy from, [user@host[:port]:]path
    #[arg(long, required_unless_present_any = ["server", "generate_keys"])]
    from: Option<String>,

    /// Client mode: file to copy to, [user@host[:port]:]path
    #[arg(long, required_unless_present_any = ["server", "generate_keys"])]
    to: Option<String>,

    /// Path to the private key (default ~/.ucp/ucp.pem)
    #[arg(long)]
    private_key_path: Option<PathBuf>,

    /// Path to the public key (default ~/.ucp/key.pub)
    #[arg(long)]
    public_key_path: Option<PathBuf>,

    /// Generate a key pair and exit
    #[arg(long)]
    generate_keys: bool,

    /// Key size for --generate-keys
    #[arg(long, default_value_t = RSA_KEY_BITS)]
    key_bits: usize,

    /// Server mode: directory of per-user keys, <dir>/<user>/ucp.pem
    #[arg(long)]
    key_dir: Option<PathBuf>,

    /// Seconds to wait for the peer before retrying once
    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT.as_secs())]
    read_timeout: u64,

    /// Log level
    #[arg(long, value_enum, ignore_case = true, default_value_t = Verbosity::Warn)]
    verbosity: Verbosity,
}

#[derive(Clone, Copy, ValueEnum)]
#[value(rename_all = "UPPER")]
enum Verbosity {
    Error,
    Warn,
    Info,
    Debug,
}

impl From<Verbosity> for log::LevelFilter {
    fn from(verbosity: Verbosity) -> Self {
        match verbosity {
            Verbosity::Error => log::LevelFilter::Error,
            Verbosity::Warn => log::LevelFilter::Warn,
            Verbosity::Info => log::LevelFilter::Info,
            Verbosity::Debug => log::LevelFilter::Debug,
        }
    }
}

fn default_key_path(name: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
    home.join(".ucp").join(name)
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let private_key_path = cli.private_key_path.unwrap_or_else(|| default_key_path("ucp.pem"));
    let public_key_path = cli.public_key_path.unwrap_or_else(|| default_key_path("key.pub"));
    let read_timeout = Duration::from_secs(cli.read_timeout);

    if cli.generate_keys {
        return ucp::commands::keygen::run(&private_key_path, &public_key_path, cli.key_bits).await;
    }

    if cli.server {
        return ucp::commands::server::run(&cli.host, cli.port, &private_key_path, cli.key_dir, read_timeout).await;
    }

    let from = cli.from.ok_or("--from is required in client mode")?;
    let to = cli.to.ok_or("--to is required in client mode")?;
    ucp::commands::client::run(&from, &to, &private_key_path, read_timeout).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Per-module RUST_LOG directives still apply.
    env_logger::Builder::from_default_env()
        .filter_level(cli.verbosity.into())
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ucp: {}", e);
            ExitCode::FAILURE
        }
    }
}
