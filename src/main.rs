use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, Notify};

use meshdrop::config::{validate_session_id, Config, Overrides};
use meshdrop::daemon::{Daemon, DaemonOptions};
use meshdrop::events::Notification;
use meshdrop::session::{new_session_id, SessionHandle};
use meshdrop::transfer::{Author, TransferStatus};
use meshdrop::wsproto::Role;

#[derive(Parser, Debug)]
#[command(name = "meshdrop", version, about = "Send files and chat peer to peer")]
struct Cli {
    /// Path to a JSON config file
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Relay base URL (http, https, ws or wss)
    #[arg(long, global = true)]
    relay: Option<String>,

    /// Where received files are written
    #[arg(long = "download-dir", global = true)]
    download_dir: Option<PathBuf>,

    /// Local control plane address, e.g. 127.0.0.1:7938
    #[arg(long = "http-addr", global = true)]
    http_addr: Option<String>,

    #[arg(long = "http-token", global = true)]
    http_token: Option<String>,

    #[arg(long = "client-id", global = true)]
    client_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a new session and print its id
    Start {
        /// Files or directories to send once a peer connects
        files: Vec<PathBuf>,
    },
    /// Join an existing session
    Join {
        session: String,
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::resolve(
        cli.config.as_deref(),
        Overrides {
            relay_url: cli.relay,
            client_id: cli.client_id,
            download_dir: cli.download_dir,
            http_addr: cli.http_addr,
            http_token: cli.http_token,
        },
    )?;

    let opts = match cli.command {
        Commands::Start { files } => DaemonOptions {
            session_id: new_session_id(),
            role: Role::Initiator,
            files,
        },
        Commands::Join { session, files } => {
            validate_session_id(&session)?;
            DaemonOptions {
                session_id: session,
                role: Role::Joiner,
                files,
            }
        }
    };

    let shutdown = Arc::new(Notify::new());
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.notify_one();
        }
    });

    let daemon = Daemon::start(cfg, opts).await?;
    let session = daemon.session().clone();
    println!("session: {}", session.session_id());
    if let Some(cp) = daemon.control() {
        println!("control plane: http://{} (token {})", cp.bound_addr(), cp.token());
    }

    tokio::spawn(print_notifications(session.subscribe()));
    tokio::spawn(read_stdin(session, shutdown.clone()));

    daemon.wait(shutdown).await
}

async fn read_stdin(session: SessionHandle, shutdown: Arc<Notify>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let result = match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => {
                shutdown.notify_one();
                return;
            }
            ("/status", _) => serde_json::to_string_pretty(&session.snapshot())
                .map(|s| println!("{s}"))
                .map_err(anyhow::Error::from),
            ("/send", path) if !path.trim().is_empty() => session
                .send_file(path.trim())
                .await
                .map(|ids| println!("queued {} file(s)", ids.len())),
            ("/send", _) => {
                eprintln!("usage: /send <path>");
                Ok(())
            }
            _ => session.send_text(line).map(|_| ()),
        };
        if let Err(e) = result {
            eprintln!("error: {e:#}");
        }
    }
}

async fn print_notifications(mut rx: broadcast::Receiver<Notification>) {
    loop {
        let n = match rx.recv().await {
            Ok(n) => n,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match n {
            Notification::PeersChanged { peers } if !peers.is_empty() => {
                println!("peer joined: {}", peers.join(", "));
            }
            Notification::ConnectionChanged { state } => println!("connection: {state:?}"),
            Notification::MessageReceived { message } if message.author == Author::Remote => {
                println!("> {}", message.text);
            }
            Notification::TransferUpdated { transfer } => match transfer.status {
                TransferStatus::Completed => println!("done: {}", transfer.name),
                TransferStatus::Error => println!(
                    "failed: {} ({})",
                    transfer.name,
                    transfer.error.unwrap_or_default()
                ),
                _ => {}
            },
            Notification::FileSaved { path, sha1, .. } => {
                println!("saved {} (sha1 {sha1})", path.display());
            }
            _ => {}
        }
    }
}
