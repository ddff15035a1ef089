//! not-my-board Agent
//!
//! Long-lived daemon plus the client subcommands that drive it over the
//! local socket. Exit codes: 0 success, 1 failure, 2 usage error, 3 no
//! matching place, 4 auth failure.

use std::sync::Arc;

use agent::agent::{Agent, AgentHandle, ListEntry, ReservationStatus};
use agent::config::find_import_description;
use agent::ipc::{
    self, bind_socket, ipc_call, run_ipc_server, NameParams, ReserveParams, ReturnParams,
    UpdateParams,
};
use agent::session::run_hub_session;
use agent::vhci::Vhci;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::setup_logging;
use protocol::{ErrorKind, RpcError};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

const EXIT_FAILURE: i32 = 1;
const EXIT_NO_MATCH: i32 = 3;
const EXIT_AUTH: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "not-my-board-agent")]
#[command(author, version, about = "Board farm agent - reserve and attach remote hardware")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent daemon
    Daemon {
        /// Hub URL, e.g. "http://hub.example.com:2092"
        #[arg(long, value_name = "URL")]
        hub_url: String,

        /// Bearer token for the hub control channel
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,
    },
    /// Reserve a place described by an import description
    Reserve {
        /// Import description name or path
        name: String,
    },
    /// Attach a reserved place; reserves it first if necessary
    Attach {
        name: String,

        /// Keep other attached places instead of returning them
        #[arg(long)]
        keep_others: bool,
    },
    /// Detach a place's local interfaces
    Detach {
        name: String,

        /// Keep the reservation instead of returning it
        #[arg(long)]
        keep: bool,
    },
    /// Return a reservation
    #[command(name = "return")]
    Return {
        name: String,

        /// Return even while attached
        #[arg(long)]
        force: bool,
    },
    /// List reservations
    List,
    /// Show interface status
    Status,
    /// Edit the import description of a reservation
    Edit {
        name: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = setup_logging(&args.log_level) {
        eprintln!("Error: {err}");
        std::process::exit(EXIT_FAILURE);
    }

    let code = match run(args.command).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err:#}");
            exit_code(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<RpcError>().and_then(RpcError::remote_kind) {
        Some(ErrorKind::NoMatch) => EXIT_NO_MATCH,
        Some(ErrorKind::Auth) => EXIT_AUTH,
        _ => EXIT_FAILURE,
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Daemon { hub_url, token } => daemon(hub_url, token).await,
        Command::Reserve { name } => reserve(&name).await,
        Command::Attach { name, keep_others } => attach(&name, keep_others).await,
        Command::Detach { name, keep } => detach(&name, keep).await,
        Command::Return { name, force } => {
            call::<_, Value>("return_reservation", &ReturnParams { name, force }).await?;
            println!("Returned");
            Ok(())
        }
        Command::List => list().await,
        Command::Status => status().await,
        Command::Edit { name } => edit(&name).await,
    }
}

async fn daemon(hub_url: String, token: Option<String>) -> Result<()> {
    info!("not-my-board agent v{}", env!("CARGO_PKG_VERSION"));

    let hub_host = url::Url::parse(&hub_url)
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()))
        .with_context(|| format!("no host in hub URL {hub_url:?}"))?;

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let actor = Agent::new(hub_host, Arc::new(Vhci::new()), cmd_tx.clone());
    let actor_task = tokio::spawn(actor.run(cmd_rx));

    let session_task = tokio::spawn(run_hub_session(hub_url, token, cmd_tx.clone()));

    let socket_path = ipc::socket_path();
    let listener = bind_socket(&socket_path).await?;
    info!("listening on {}", socket_path.display());

    let handle = AgentHandle::new(cmd_tx);
    let result = tokio::select! {
        result = run_ipc_server(listener, handle) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("error waiting for Ctrl+C")?;
            info!("received Ctrl+C, shutting down");
            Ok(())
        }
    };

    session_task.abort();
    drop(actor_task);
    let _ = std::fs::remove_file(&socket_path);
    result
}

/// Client-side call with typed error pass-through for exit codes.
async fn call<P, R>(method: &str, params: &P) -> Result<R>
where
    P: serde::Serialize + ?Sized,
    R: serde::de::DeserializeOwned,
{
    ipc_call(&ipc::socket_path(), method, params)
        .await
        .map_err(anyhow::Error::from)
}

async fn reserve(name: &str) -> Result<()> {
    let (reservation_name, spec) = find_import_description(name)?;
    call::<_, Value>(
        "reserve",
        &ReserveParams {
            name: reservation_name.clone(),
            spec,
        },
    )
    .await?;
    println!("Reserved \"{reservation_name}\"");
    Ok(())
}

async fn attach(name: &str, keep_others: bool) -> Result<()> {
    let reserved: Vec<ListEntry> = call("list", &Value::Null).await?;
    let known = reserved.iter().any(|entry| entry.place == name);

    let reservation_name = if known {
        name.to_string()
    } else {
        let (reservation_name, spec) = find_import_description(name)?;
        call::<_, Value>(
            "reserve",
            &ReserveParams {
                name: reservation_name.clone(),
                spec,
            },
        )
        .await?;
        reservation_name
    };

    call::<_, Value>(
        "attach",
        &NameParams {
            name: reservation_name.clone(),
        },
    )
    .await?;
    println!("Attached \"{reservation_name}\"");

    if !keep_others {
        for entry in reserved {
            if entry.place != reservation_name {
                call::<_, Value>(
                    "return_reservation",
                    &ReturnParams {
                        name: entry.place,
                        force: true,
                    },
                )
                .await?;
            }
        }
    }
    Ok(())
}

async fn detach(name: &str, keep: bool) -> Result<()> {
    call::<_, Value>(
        "detach",
        &NameParams {
            name: name.to_string(),
        },
    )
    .await?;
    if !keep {
        call::<_, Value>(
            "return_reservation",
            &ReturnParams {
                name: name.to_string(),
                force: false,
            },
        )
        .await?;
    }
    println!("Detached \"{name}\"");
    Ok(())
}

async fn list() -> Result<()> {
    let entries: Vec<ListEntry> = call("list", &Value::Null).await?;
    println!("{:<24} {}", "PLACE", "ATTACHED");
    let mut entries = entries;
    entries.sort_by(|a, b| a.place.cmp(&b.place));
    for entry in entries {
        println!(
            "{:<24} {}",
            entry.place,
            if entry.attached { "yes" } else { "no" }
        );
    }
    Ok(())
}

async fn status() -> Result<()> {
    let mut reservations: Vec<ReservationStatus> = call("status", &Value::Null).await?;
    reservations.sort_by(|a, b| a.place.cmp(&b.place));

    println!(
        "{:<16} {:<12} {:<12} {:<12} {:<6} {}",
        "PLACE", "STATE", "PART", "INTERFACE", "TYPE", "ATTACHED"
    );
    for reservation in reservations {
        let state = match &reservation.reason {
            Some(reason) => format!("{} ({reason})", reservation.state),
            None => reservation.state.clone(),
        };
        if reservation.interfaces.is_empty() {
            println!("{:<16} {:<12} -", reservation.place, state);
            continue;
        }
        for iface in &reservation.interfaces {
            println!(
                "{:<16} {:<12} {:<12} {:<12} {:<6} {}",
                reservation.place,
                state,
                iface.part,
                iface.interface,
                iface.kind,
                if iface.attached { "yes" } else { "no" }
            );
        }
    }
    Ok(())
}

async fn edit(name: &str) -> Result<()> {
    let spec: protocol::ImportSpec = call(
        "get_import_description",
        &NameParams {
            name: name.to_string(),
        },
    )
    .await?;
    let original = toml::to_string_pretty(&spec).context("failed to render description")?;

    let mut file = tempfile::Builder::new()
        .prefix("not-my-board-")
        .suffix(".toml")
        .tempfile()
        .context("failed to create temporary file")?;
    std::io::Write::write_all(&mut file, original.as_bytes())
        .context("failed to write temporary file")?;

    let editor = std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());
    let status = tokio::process::Command::new(&editor)
        .arg(file.path())
        .status()
        .await
        .with_context(|| format!("failed to run {editor:?}"))?;

    let new_content =
        std::fs::read_to_string(file.path()).context("failed to read edited file")?;
    if !status.success() {
        anyhow::bail!("{editor:?} exited with {status}");
    }

    let new_spec = match agent::config::parse_import_description(&new_content) {
        Ok(spec) => spec,
        Err(err) => {
            anyhow::bail!(
                "failed to edit, here is your changed import description for reference:\n{}\n\n{err:#}",
                new_content.trim_end()
            );
        }
    };

    call::<_, Value>(
        "update_import_description",
        &UpdateParams {
            name: name.to_string(),
            spec: new_spec,
        },
    )
    .await?;
    println!("Updated \"{name}\"");
    Ok(())
}
