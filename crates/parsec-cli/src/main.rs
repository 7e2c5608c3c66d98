//! Operator CLI driving the client sync core end to end: create/open a
//! device file, spin up a `UserFS`, and issue one workspace/file operation
//! per invocation. Modeled on the teacher's `guard-cli`: a `clap` derive
//! enum of subcommands, one async client built up front, results printed
//! as pretty JSON.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use parsec_core::config::CoreConfig;
use parsec_core::device::DeviceFile;
use parsec_core::ids::{EntryID, UserID};
use parsec_core::paths;
use parsec_core::workspace_entry::Role;
use parsec_core::{EventBus, LocalStorage};
use parsec_remote::{HttpRealmClient, RealmClient, RemoteDevicesManager};
use parsec_sync::fs_path::FsPath;
use parsec_sync::user_fs::UserFS;

#[derive(Parser)]
#[command(name = "parsec-cli")]
#[command(about = "Operator CLI for the Parsec client synchronization core", long_about = None)]
struct Cli {
    /// Device file slug (one device file per identity, under the app data dir).
    #[arg(long, global = true, default_value = "default")]
    device: String,

    /// Password unlocking the device file.
    #[arg(long, global = true, env = "PARSEC_PASSWORD")]
    password: Option<String>,

    /// Base URL of the realm service.
    #[arg(long, global = true, default_value = "http://127.0.0.1:6770")]
    server: String,

    /// Bearer token for the realm service's authenticated session.
    #[arg(long, global = true, default_value = "")]
    token: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a brand-new device file and bootstrap its user manifest.
    Enroll {
        user_id: String,
        device_name: String,
        organization_id: String,
    },

    /// List workspaces known to the local user manifest.
    WorkspaceList,

    /// Create a new workspace.
    WorkspaceCreate { name: String },

    /// Rename a workspace.
    WorkspaceRename { id: String, new_name: String },

    /// Share a workspace with another user, or revoke access with `--revoke`.
    WorkspaceShare {
        id: String,
        recipient: String,
        #[arg(long, value_enum)]
        role: Option<CliRole>,
        #[arg(long)]
        revoke: bool,
    },

    /// Sync the user manifest (workspace list) with the server.
    Sync,

    /// Drain pending sharing/ping messages.
    ProcessMessages,

    /// List a folder inside a workspace.
    Ls { workspace: String, path: String },

    /// Create a folder inside a workspace.
    Mkdir { workspace: String, path: String },

    /// Create an empty file inside a workspace.
    Touch { workspace: String, path: String },

    /// Write bytes (UTF-8 from the command line) to a file at an offset.
    Write {
        workspace: String,
        path: String,
        data: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Read bytes from a file and print them as UTF-8 (lossily).
    Read {
        workspace: String,
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 65536)]
        size: u64,
    },

    /// Sync a single workspace (its root and, recursively, its children).
    WorkspaceSync { workspace: String },

    /// Run the background monitors (message/sync/backend-connection) until
    /// interrupted (spec §4.8).
    Run,
}

#[derive(Clone, clap::ValueEnum)]
enum CliRole {
    Owner,
    Manager,
    Contributor,
    Reader,
}

impl From<CliRole> for Role {
    fn from(r: CliRole) -> Self {
        match r {
            CliRole::Owner => Role::Owner,
            CliRole::Manager => Role::Manager,
            CliRole::Contributor => Role::Contributor,
            CliRole::Reader => Role::Reader,
        }
    }
}

fn read_password(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("failed to read password")
}

fn print_json(value: serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(&value).expect("json always serializes"));
}

/// An unlocked device plus the client/event-bus handles every monitor and
/// filesystem surface is built from (spec §9 "model them as explicit values
/// threaded through constructors rather than singletons").
struct Session {
    user_fs: UserFS,
    client: Arc<dyn RealmClient>,
    events: Arc<EventBus>,
    config: CoreConfig,
}

async fn open_session(cli: &Cli) -> Result<Session> {
    let device_path = paths::device_file_path(&cli.device)?;
    let password = match &cli.password {
        Some(p) => p.clone(),
        None => read_password("device password: ")?,
    };
    let device = DeviceFile::open(&device_path, &password)
        .map_err(|e| anyhow!("failed to unlock device file {}: {e}", device_path.display()))?;

    let config = CoreConfig::default();
    let storage_dir = paths::storage_dir(&cli.device)?;
    let storage = Arc::new(LocalStorage::open(&storage_dir, &config)?);
    let events = Arc::new(EventBus::new(config.event_bus_queue_size));
    let client: Arc<dyn RealmClient> = Arc::new(HttpRealmClient::new(
        cli.server.clone(),
        cli.token.clone(),
        Duration::from_millis(config.rpc_timeout_ms),
    ));
    let devices = Arc::new(RemoteDevicesManager::new(client.clone()));

    let user_fs = UserFS::new(
        device.user_manifest_id(),
        device.device_id(),
        device.signing_key(),
        device.user_manifest_key().clone(),
        client.clone(),
        devices,
        storage,
        events.clone(),
        config.default_blocksize,
    );

    Ok(Session {
        user_fs,
        client,
        events,
        config,
    })
}

fn open_workspace(user_fs: &UserFS, workspace_id: &str) -> Result<parsec_sync::workspace_fs::WorkspaceFS> {
    let id = EntryID::from_uuid(
        uuid::Uuid::parse_str(workspace_id).context("workspace id must be a UUID")?,
    );
    let entry = user_fs
        .workspaces()?
        .into_iter()
        .find(|w| w.id == id)
        .ok_or_else(|| anyhow!("no such workspace: {workspace_id}"))?;
    Ok(user_fs.workspace(&entry))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Enroll {
            user_id,
            device_name,
            organization_id,
        } => {
            let device_path = paths::device_file_path(&cli.device)?;
            let password = match &cli.password {
                Some(p) => p.clone(),
                None => read_password("new device password: ")?,
            };
            let device = DeviceFile::create_new(&device_path, &password, user_id, device_name, organization_id)
                .map_err(|e| anyhow!("failed to create device file: {e}"))?;

            let config = CoreConfig::default();
            let storage_dir = paths::storage_dir(&cli.device)?;
            let storage = LocalStorage::open(&storage_dir, &config)?;
            UserFS::bootstrap(device.user_manifest_id(), device.device_id(), &storage)?;

            print_json(json!({
                "device_id": device.device_id().to_string(),
                "user_manifest_id": device.user_manifest_id().to_string(),
                "device_file": device_path.display().to_string(),
            }));
        }

        Commands::WorkspaceList => {
            let user_fs = open_session(&cli).await?.user_fs;
            let workspaces = user_fs.workspaces()?;
            print_json(json!(workspaces
                .iter()
                .map(|w| json!({
                    "id": w.id.to_string(),
                    "name": w.name,
                    "role": w.role,
                    "encryption_revision": w.encryption_revision,
                }))
                .collect::<Vec<_>>()));
        }

        Commands::WorkspaceCreate { name } => {
            let user_fs = open_session(&cli).await?.user_fs;
            let id = user_fs.workspace_create(name.clone()).await?;
            print_json(json!({ "id": id.to_string() }));
        }

        Commands::WorkspaceRename { id, new_name } => {
            let user_fs = open_session(&cli).await?.user_fs;
            let id = EntryID::from_uuid(uuid::Uuid::parse_str(id).context("workspace id must be a UUID")?);
            user_fs.workspace_rename(id, new_name.clone()).await?;
            print_json(json!({ "status": "renamed" }));
        }

        Commands::WorkspaceShare {
            id,
            recipient,
            role,
            revoke,
        } => {
            let user_fs = open_session(&cli).await?.user_fs;
            let id = EntryID::from_uuid(uuid::Uuid::parse_str(id).context("workspace id must be a UUID")?);
            let role = if *revoke {
                None
            } else {
                Some(role.clone().ok_or_else(|| anyhow!("--role is required unless --revoke is set"))?.into())
            };
            user_fs.workspace_share(id, UserID(recipient.clone()), role).await?;
            print_json(json!({ "status": "shared" }));
        }

        Commands::Sync => {
            let user_fs = open_session(&cli).await?.user_fs;
            user_fs.sync().await?;
            print_json(json!({ "status": "synced" }));
        }

        Commands::ProcessMessages => {
            let user_fs = open_session(&cli).await?.user_fs;
            user_fs.process_last_messages().await?;
            print_json(json!({ "status": "processed" }));
        }

        Commands::Ls { workspace, path } => {
            let user_fs = open_session(&cli).await?.user_fs;
            let ws = open_workspace(&user_fs, workspace)?;
            let fs_path = FsPath::parse(path)?;
            let entries = ws.list_folder(&fs_path).await?;
            print_json(json!(entries));
        }

        Commands::Mkdir { workspace, path } => {
            let user_fs = open_session(&cli).await?.user_fs;
            let ws = open_workspace(&user_fs, workspace)?;
            let fs_path = FsPath::parse(path)?;
            let id = ws.folder_create(&fs_path).await?;
            print_json(json!({ "id": id.to_string() }));
        }

        Commands::Touch { workspace, path } => {
            let user_fs = open_session(&cli).await?.user_fs;
            let ws = open_workspace(&user_fs, workspace)?;
            let fs_path = FsPath::parse(path)?;
            let id = ws.file_create(&fs_path).await?;
            print_json(json!({ "id": id.to_string() }));
        }

        Commands::Write {
            workspace,
            path,
            data,
            offset,
        } => {
            let user_fs = open_session(&cli).await?.user_fs;
            let ws = open_workspace(&user_fs, workspace)?;
            let fs_path = FsPath::parse(path)?;
            ws.write(&fs_path, *offset, data.as_bytes()).await?;
            print_json(json!({ "status": "written", "bytes": data.len() }));
        }

        Commands::Read {
            workspace,
            path,
            offset,
            size,
        } => {
            let user_fs = open_session(&cli).await?.user_fs;
            let ws = open_workspace(&user_fs, workspace)?;
            let fs_path = FsPath::parse(path)?;
            let bytes = ws.read(&fs_path, *offset, *size).await?;
            print_json(json!({ "data": String::from_utf8_lossy(&bytes) }));
        }

        Commands::WorkspaceSync { workspace } => {
            let user_fs = open_session(&cli).await?.user_fs;
            let ws = open_workspace(&user_fs, workspace)?;
            ws.sync_root().await?;
            print_json(json!({ "status": "synced" }));
        }

        Commands::Run => {
            let session = open_session(&cli).await?;
            let user_fs = Arc::new(session.user_fs);
            let workspaces: Vec<Arc<parsec_sync::workspace_fs::WorkspaceFS>> = user_fs
                .workspaces()?
                .iter()
                .map(|entry| Arc::new(user_fs.workspace(entry)))
                .collect();

            let mut targets: Vec<Arc<dyn parsec_sync::monitors::SyncTarget>> =
                vec![user_fs.clone() as Arc<dyn parsec_sync::monitors::SyncTarget>];
            targets.extend(
                workspaces
                    .iter()
                    .map(|ws| ws.clone() as Arc<dyn parsec_sync::monitors::SyncTarget>),
            );

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let message_handle = parsec_sync::monitors::spawn_message_monitor(
                user_fs.clone(),
                Duration::from_millis(session.config.message_poll_interval_ms),
                shutdown_rx.clone(),
            );
            let sync_handle = parsec_sync::monitors::spawn_sync_monitor(
                targets,
                session.events.clone(),
                Duration::from_millis(session.config.sync_debounce_ms),
                shutdown_rx.clone(),
            );
            let backend_handle = parsec_sync::monitors::spawn_backend_connection_monitor(
                session.client.clone(),
                session.events.clone(),
                Duration::from_millis(session.config.heartbeat_interval_ms),
                Duration::from_millis(session.config.backoff_initial_ms),
                Duration::from_millis(session.config.backoff_max_ms),
                shutdown_rx,
            );

            tracing::info!("monitors running, press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            shutdown_tx.send(true).ok();
            let _ = tokio::join!(message_handle, sync_handle, backend_handle);
            print_json(json!({ "status": "stopped" }));
        }
    }

    Ok(())
}
