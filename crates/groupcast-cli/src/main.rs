// groupcast — operator command line.
// Every request/response operation of the service, printed as JSON.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{error, info};
use serde::Serialize;

use groupcast::engine::lifecycle::QrResult;
use groupcast::{EngineConfig, EngineError, GroupcastService, SyncStatus};

#[derive(Parser, Debug)]
#[command(name = "groupcast", about = "Connect a WhatsApp channel, sync its groups, broadcast", version)]
struct Cli {
    /// TOML config file. Missing file means defaults.
    #[arg(long, global = true, env = "GROUPCAST_CONFIG")]
    config: Option<PathBuf>,

    /// User whose channel the command acts on.
    #[arg(long, short, global = true, env = "GROUPCAST_USER", default_value = "default")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the channel status (with --refresh, reconcile with the gateway first).
    Status {
        #[arg(long)]
        refresh: bool,
    },
    /// Provision a channel and wait until it is launch-ready.
    Create {
        /// Replace an active channel.
        #[arg(long)]
        force: bool,
    },
    /// Request a QR code; with --out, write the decoded image to a file.
    Qr {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Log in with a phone number instead of a QR scan.
    LoginPhone { phone: String },
    /// Log out and drop synced groups, keeping the channel for re-auth.
    Disconnect,
    /// Delete the channel upstream and locally.
    Delete,
    /// Check status, repair the identifier, and optionally recreate.
    Recover {
        #[arg(long)]
        force_new: bool,
    },
    /// Run a full group sync in the foreground. Ctrl-C cancels.
    Sync {
        /// Ignore the post-sync cooldown.
        #[arg(long)]
        force: bool,
        /// Progress poll interval in seconds.
        #[arg(long, default_value_t = 3)]
        interval: u64,
    },
    /// Show the last sync progress row.
    Progress,
    /// Classify stored groups (all pending, or the given ids).
    Classify { group_ids: Vec<String> },
    /// List synced groups.
    Groups {
        #[arg(long)]
        admin_only: bool,
    },
    /// Send a text to administered groups.
    Broadcast {
        #[arg(long, required = true, num_args = 1..)]
        group: Vec<String>,
        text: String,
    },
    /// Switch the channel to live mode (paid plan required).
    UpgradeLive,
    /// Tear the channel down if the plan expired.
    EnforcePlan,
    /// One reaper sweep over all users.
    Reap,
    /// Print shell completions.
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run().await {
        error!("{}", err);
        eprintln!("error: {} ({})", err, err.recovery_hint());
        std::process::exit(1);
    }
}

async fn run() -> Result<(), EngineError> {
    let cli = Cli::parse();
    if let Command::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "groupcast", &mut io::stdout());
        return Ok(());
    }

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    // A background readiness poll would die with the process; `create` polls inline.
    config.lifecycle.auto_poll_ready = false;
    let service = GroupcastService::from_config(&config)?;
    let user = cli.user.as_str();

    match cli.command {
        Command::Status { refresh } => print(&service.get_channel_status(user, refresh).await?),
        Command::Create { force } => {
            let created = service.create_channel(user, force).await?;
            print(&created)?;
            print(&service.controller.poll_ready(user).await?)
        }
        Command::Qr { out } => {
            let result = service.get_qr(user).await?;
            if let (Some(path), QrResult::Displayed { qr }) = (out, &result) {
                std::fs::write(&path, qr.bytes())?;
                info!("QR written to {:?}", path);
            }
            print(&result)
        }
        Command::LoginPhone { phone } => print(&service.login_with_phone(user, &phone).await?),
        Command::Disconnect => print(&service.hard_disconnect(user).await?),
        Command::Delete => print(&service.delete_channel(user).await?),
        Command::Recover { force_new } => print(&service.recover(user, force_new).await?),
        Command::Sync { force, interval } => follow_sync(&service, user, force, interval).await,
        Command::Progress => print(&service.get_sync_progress(user)?),
        Command::Classify { group_ids } => {
            let ids = (!group_ids.is_empty()).then_some(group_ids);
            print(&service.classify_groups(user, ids).await?)
        }
        Command::Groups { admin_only } => print(&service.list_groups(user, admin_only)?),
        Command::Broadcast { group, text } => print(&service.broadcast(user, &group, &text).await?),
        Command::UpgradeLive => print(&service.upgrade_to_live(user).await?),
        Command::EnforcePlan => print(&service.enforce_plan(user).await?),
        Command::Reap => print(&service.reap().await?),
        Command::Completions { .. } => Ok(()),
    }
}

/// Start a background run and poll it until terminal, cancelling on Ctrl-C.
async fn follow_sync(service: &GroupcastService, user: &str, force: bool, interval: u64) -> Result<(), EngineError> {
    service.start_sync(user, force)?;
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    let mut cancel_sent = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                info!("cancel requested, stopping at the next batch");
                service.cancel_sync(user);
                cancel_sent = true;
            }
        }
        let row = service.get_sync_progress(user)?;
        eprintln!(
            "{:>3}% {} {} ({} groups, {} admin)",
            row.percent(),
            row.status,
            row.message,
            row.groups_found,
            row.admins_found
        );
        if row.status.is_terminal() || row.status == SyncStatus::NotRunning {
            return print(&row);
        }
    }
}

fn print<T: Serialize>(value: &T) -> Result<(), EngineError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
