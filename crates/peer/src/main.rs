//! DashDrop
//!
//! Command-line peer for LAN file transfers.

use std::io::{self, BufRead, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peer::config::{default_config_path, Config};
use peer::session::{DecryptOutcome, PendingDecryption, ReceiveOutcome, TransferRequest};
use peer::{decrypt_pending, logging, ConsoleObserver, Peer};

/// DashDrop - send files and folders to devices on the local network.
#[derive(Parser, Debug)]
#[command(name = "dashdrop")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List receivers on the local network
    Discover {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Wait for incoming transfers
    Receive {
        /// Exit after the first transfer
        #[arg(long)]
        once: bool,
    },

    /// Send files or folders to a receiver
    Send {
        /// Receiver address
        addr: IpAddr,

        /// Files and folders to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Encrypt every file (asks for a password unless --password is given)
        #[arg(long, short)]
        encrypt: bool,

        /// Encryption password; implies --encrypt
        #[arg(long)]
        password: Option<String>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if let Commands::Config(cmd) = &cli.command {
        return run_config_command(cmd, &config_path);
    }

    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = logging::init(&config.logging, cli.verbose)?;
    tracing::info!("Using config file: {:?}", config_path);

    let peer = Peer::new(config);
    match cli.command {
        Commands::Discover { json } => run_discover(&peer, json).await,
        Commands::Receive { once } => run_receive(&peer, once).await,
        Commands::Send {
            addr,
            paths,
            encrypt,
            password,
        } => run_send(&peer, addr, paths, encrypt, password).await,
        Commands::Config(_) => Ok(()),
    }
}

fn run_config_command(cmd: &ConfigCommands, path: &Path) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let mut config = Config::load(path)?;
            config.apply_env_overrides();
            print!("{}", config.to_toml()?);
        }
        ConfigCommands::Path => {
            println!("{}", path.display());
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

async fn run_discover(peer: &Peer, json: bool) -> Result<()> {
    let devices = peer.discover().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No receivers found.");
        return Ok(());
    }

    println!("{:<20} NAME", "ADDRESS");
    println!("{}", "-".repeat(40));
    for device in &devices {
        println!("{:<20} {}", device.address, device.display_name);
    }
    Ok(())
}

async fn run_send(
    peer: &Peer,
    addr: IpAddr,
    paths: Vec<PathBuf>,
    encrypt: bool,
    password: Option<String>,
) -> Result<()> {
    let request = TransferRequest::new(paths)?;

    let password = match password {
        Some(password) => Some(password),
        None if encrypt || peer.config().transfer.encryption => {
            Some(prompt_password().context("A password is required to encrypt")?)
        }
        None => None,
    };

    let observer = ConsoleObserver::sending();
    let summary = peer.send_to(addr, &request, password, &observer).await?;
    println!("Sent {} file(s), {} bytes", summary.files, summary.bytes);
    Ok(())
}

async fn run_receive(peer: &Peer, once: bool) -> Result<()> {
    let advertiser = peer.spawn_advertiser()?;
    let endpoint = peer.listen().await?;
    println!(
        "Waiting for files as {:?} (saving to {})",
        peer.config().device.name,
        peer.config().transfer.save_dir.display()
    );

    let stopper = peer.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.cancel();
        }
    });

    let result = loop {
        let observer = ConsoleObserver::receiving();
        match peer.receive_on(&endpoint, &observer).await {
            Ok(outcome) => {
                print_received(&outcome);
                decrypt_received(outcome.pending).await?;
                if once {
                    break Ok(());
                }
            }
            Err(_) if peer.shutdown_token().is_cancelled() => break Ok(()),
            Err(e) if once => break Err(e),
            Err(e) => eprintln!("Transfer failed: {:#}", e),
        }
    };

    peer.stop();
    match advertiser.await {
        Ok(Err(e)) => tracing::warn!("Advertiser stopped with error: {}", e),
        Err(e) => tracing::warn!("Advertiser task failed: {}", e),
        Ok(Ok(())) => {}
    }
    result
}

fn print_received(outcome: &ReceiveOutcome) {
    println!(
        "Received {} file(s) into {}",
        outcome.received.len(),
        outcome.destination.display()
    );
    if !outcome.halted {
        println!("Sender closed the connection without finishing.");
    }
}

async fn decrypt_received(pending: PendingDecryption) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    println!(
        "{} encrypted file(s) received, {} password attempt(s) allowed.",
        pending.files().len(),
        pending.remaining_attempts()
    );

    match decrypt_pending(pending, prompt_password).await? {
        DecryptOutcome::Decrypted(files) => println!("Decrypted {} file(s)", files.len()),
        DecryptOutcome::WrongPassword { remaining_attempts } => {
            println!("Wrong password, {} attempt(s) left", remaining_attempts)
        }
        DecryptOutcome::AttemptsExhausted { deleted } => {
            println!("Too many wrong passwords, deleted {} encrypted file(s)", deleted.len())
        }
        DecryptOutcome::Abandoned { kept } => {
            println!("Kept {} encrypted file(s)", kept.len());
            for file in kept {
                println!("  {}", file.display());
            }
        }
    }
    Ok(())
}

/// Read a password from stdin. Empty input or EOF gives up.
fn prompt_password() -> Option<String> {
    print!("Password (empty to skip): ");
    io::stdout().flush().ok()?;

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            let password = line.trim_end_matches(['\r', '\n']).to_string();
            (!password.is_empty()).then_some(password)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_discover_command() {
        let cli = Cli::try_parse_from(["dashdrop", "discover"]).unwrap();
        match cli.command {
            Commands::Discover { json } => assert!(!json),
            _ => panic!("Expected Discover command"),
        }
    }

    #[test]
    fn test_receive_once() {
        let cli = Cli::try_parse_from(["dashdrop", "receive", "--once"]).unwrap();
        match cli.command {
            Commands::Receive { once } => assert!(once),
            _ => panic!("Expected Receive command"),
        }
    }

    #[test]
    fn test_send_command() {
        let cli = Cli::try_parse_from([
            "dashdrop",
            "send",
            "192.168.1.20",
            "photos",
            "notes.txt",
            "--encrypt",
        ])
        .unwrap();
        match cli.command {
            Commands::Send {
                addr,
                paths,
                encrypt,
                password,
            } => {
                assert_eq!(addr, "192.168.1.20".parse::<IpAddr>().unwrap());
                assert_eq!(paths, vec![PathBuf::from("photos"), PathBuf::from("notes.txt")]);
                assert!(encrypt);
                assert_eq!(password, None);
            }
            _ => panic!("Expected Send command"),
        }
    }

    #[test]
    fn test_send_requires_paths() {
        assert!(Cli::try_parse_from(["dashdrop", "send", "10.0.0.2"]).is_err());
    }

    #[test]
    fn test_send_rejects_bad_address() {
        assert!(Cli::try_parse_from(["dashdrop", "send", "not-an-ip", "a.txt"]).is_err());
    }

    #[test]
    fn test_config_init_force() {
        let cli = Cli::try_parse_from(["dashdrop", "config", "init", "--force"]).unwrap();
        match cli.command {
            Commands::Config(ConfigCommands::Init { force }) => assert!(force),
            _ => panic!("Expected Config Init command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["dashdrop", "receive", "--verbose", "--config", "/tmp/d.toml"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/d.toml")));
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        assert!(run_config_command(&ConfigCommands::Init { force: false }, &path).is_err());
        run_config_command(&ConfigCommands::Init { force: true }, &path).unwrap();
        assert!(Config::load(&path).is_ok());
    }
}
