//! FilenVault CLI - encrypted transfers against a Filen account.
//!
//! Every command logs in first. Credentials come from `--email` /
//! `FILEN_EMAIL` and `FILEN_PASSWORD`, or are prompted for.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use filenvault_api::{ClientConfig, HttpApi};
use filenvault_common::{Credentials, FolderRef, RemoteId};
use filenvault_crypto::KdfParams;
use filenvault_transfer::{
    create_folder, list_folder, move_file, move_folder, trash_file, trash_folder,
    CancellationToken, DownloadEngine, UploadOrchestrator, UploadProgress,
};
use filenvault_vault::Session;

#[derive(Parser)]
#[command(name = "filenvault")]
#[command(about = "FilenVault - client-side encrypted Filen transfers")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file (defaults apply when omitted).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Account email.
    #[arg(short, long, global = true, env = "FILEN_EMAIL")]
    email: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify credentials and show the account.
    Login,

    /// Encrypt and upload a file.
    Upload {
        /// Local file to upload.
        file: PathBuf,

        /// Target folder uuid (default: root).
        #[arg(short, long, default_value = "root")]
        folder: String,
    },

    /// Download and decrypt a file.
    Download {
        /// Remote file uuid.
        uuid: String,

        /// Destination file or directory.
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,
    },

    /// List a folder.
    Ls {
        /// Folder uuid (default: root).
        #[arg(default_value = "root")]
        folder: String,
    },

    /// Show storage usage.
    Usage,

    /// Create a folder.
    Mkdir {
        /// Folder name.
        name: String,

        /// Parent folder uuid (default: root).
        #[arg(short, long, default_value = "root")]
        parent: String,
    },

    /// Move a file, or a folder with --dir, into another folder.
    Mv {
        /// File or folder uuid.
        uuid: String,

        /// Destination folder uuid ("root" for the account root).
        to: String,

        /// Move a folder instead of a file.
        #[arg(short, long)]
        dir: bool,
    },

    /// Move a file to the trash.
    Rm {
        /// File uuid.
        uuid: String,
    },

    /// Move a folder and its contents to the trash.
    Rmdir {
        /// Folder uuid.
        uuid: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };

    let session = open_session(&config, cli.email).await?;

    match cli.command {
        Commands::Login => cmd_login(&session).await,
        Commands::Upload { file, folder } => cmd_upload(session, &config, &file, &folder).await,
        Commands::Download { uuid, dest } => cmd_download(session, &config, &uuid, &dest).await,
        Commands::Ls { folder } => cmd_ls(&session, &folder).await,
        Commands::Usage => cmd_usage(&session).await,
        Commands::Mkdir { name, parent } => cmd_mkdir(&session, &name, &parent).await,
        Commands::Mv { uuid, to, dir } => cmd_mv(&session, &uuid, &to, dir).await,
        Commands::Rm { uuid } => cmd_rm(&session, &uuid).await,
        Commands::Rmdir { uuid } => cmd_rmdir(&session, &uuid).await,
    }
}

/// Resolve credentials and log in.
async fn open_session(config: &ClientConfig, email: Option<String>) -> Result<Arc<Session>> {
    let email = match email {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = match std::env::var("FILEN_PASSWORD") {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password("Password: ").context("Failed to read password")?,
    };
    let credentials = Credentials::new(email, password).context("Invalid credentials")?;

    let kdf_params = KdfParams::new(config.kdf_iterations).context("Invalid kdf_iterations")?;
    let api = HttpApi::new(config).context("Failed to build HTTP client")?;

    let session = Session::open(Arc::new(api), credentials, kdf_params)
        .await
        .context("Login failed")?;
    Ok(Arc::new(session))
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;

    print!("{}", label);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("Failed to read input")?;
    Ok(line.trim().to_string())
}

/// Token cancelled on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling transfer");
            child.cancel();
        }
    });
    token
}

fn parse_folder(folder: &str) -> Result<FolderRef> {
    FolderRef::parse(folder).context("Invalid folder id")
}

async fn cmd_login(session: &Session) -> Result<()> {
    let user = session.user_info().await.context("Failed to fetch account")?;

    println!("Logged in as {}", user.email);
    if let Some(plan) = &user.plan {
        println!("  Plan: {}", plan);
    }
    Ok(())
}

async fn cmd_upload(
    session: Arc<Session>,
    config: &ClientConfig,
    file: &Path,
    folder: &str,
) -> Result<()> {
    let folder = parse_folder(folder)?;
    let orchestrator = UploadOrchestrator::new(session, config)?;
    let cancel = cancel_on_interrupt();

    let (progress, mut watcher) = watch::channel(UploadProgress::default());
    let reporter = tokio::spawn(async move {
        while watcher.changed().await.is_ok() {
            let p = *watcher.borrow_and_update();
            if p.chunks_total > 0 {
                info!("{:?}: {}/{} chunks", p.state, p.chunks_sent, p.chunks_total);
            }
            if p.state.is_terminal() {
                break;
            }
        }
    });

    let result = orchestrator
        .upload_with_progress(file, &folder, &cancel, &progress)
        .await;
    drop(progress);
    let _ = reporter.await;

    let outcome = result.with_context(|| format!("Upload of {} failed", file.display()))?;
    println!("Uploaded {}", outcome.metadata.name);
    println!("  UUID: {}", outcome.uuid);
    println!("  Size: {} bytes in {} chunks", outcome.metadata.size, outcome.chunks);
    Ok(())
}

async fn cmd_download(
    session: Arc<Session>,
    config: &ClientConfig,
    uuid: &str,
    dest: &Path,
) -> Result<()> {
    let uuid = RemoteId::new(uuid).context("Invalid file id")?;
    let engine = DownloadEngine::new(session, config)?;
    let cancel = cancel_on_interrupt();

    let (metadata, written) = engine
        .download(&uuid, dest, &cancel)
        .await
        .with_context(|| format!("Download of {} failed", uuid))?;

    println!("Downloaded {} ({} bytes)", written.display(), metadata.size);
    Ok(())
}

async fn cmd_ls(session: &Session, folder: &str) -> Result<()> {
    let folder = parse_folder(folder)?;
    let listing = list_folder(session, &folder)
        .await
        .context("Failed to list folder")?;

    if listing.folders.is_empty() && listing.files.is_empty() {
        println!("Folder is empty.");
        return Ok(());
    }

    for dir in &listing.folders {
        let name = dir.name.as_deref().unwrap_or("<undecryptable>");
        println!("  [DIR]  {}/  {}", name, dir.uuid().unwrap_or("?"));
    }
    for file in &listing.files {
        let uuid = file.uuid().unwrap_or("?");
        match &file.metadata {
            Some(meta) => println!(
                "  [FILE] {} ({} bytes, {})  {}",
                meta.name, meta.size, meta.mime, uuid
            ),
            None => println!("  [FILE] <undecryptable>  {}", uuid),
        }
    }
    if !listing.diagnostics.is_empty() {
        println!("{} entries could not be decrypted.", listing.diagnostics.len());
    }
    Ok(())
}

async fn cmd_usage(session: &Session) -> Result<()> {
    let usage = session
        .storage_usage()
        .await
        .context("Failed to fetch storage usage")?;

    println!("Storage: {} / {} bytes ({:.1}%)", usage.used, usage.total, usage.percentage());
    if let Some(speed) = usage.max_upload_speed {
        println!("  Max upload speed: {} bytes/s", speed);
    }
    Ok(())
}

async fn cmd_mkdir(session: &Session, name: &str, parent: &str) -> Result<()> {
    let parent = parse_folder(parent)?;
    let id = create_folder(session, name, &parent)
        .await
        .context("Failed to create folder")?;

    println!("Folder created: {} ({})", name, id);
    Ok(())
}

async fn cmd_mv(session: &Session, uuid: &str, to: &str, dir: bool) -> Result<()> {
    let uuid = RemoteId::new(uuid).context("Invalid id")?;
    let to = parse_folder(to)?;

    if dir {
        move_folder(session, &uuid, &to)
            .await
            .context("Failed to move folder")?;
    } else {
        move_file(session, &uuid, &to)
            .await
            .context("Failed to move file")?;
    }

    println!("Moved {} to {}", uuid, to.as_wire());
    Ok(())
}

async fn cmd_rm(session: &Session, uuid: &str) -> Result<()> {
    let uuid = RemoteId::new(uuid).context("Invalid file id")?;
    trash_file(session, &uuid)
        .await
        .context("Failed to trash file")?;

    println!("File moved to trash: {}", uuid);
    Ok(())
}

async fn cmd_rmdir(session: &Session, uuid: &str) -> Result<()> {
    let uuid = RemoteId::new(uuid).context("Invalid folder id")?;
    trash_folder(session, &uuid)
        .await
        .context("Failed to trash folder")?;

    println!("Folder moved to trash: {}", uuid);
    Ok(())
}
