//! coderunnerctl - CLI client for coderunnerd.
//!
//! Local control-plane client for the batch-execution daemon. Every
//! subcommand is a thin wrapper around one HTTP call in Section 6's
//! endpoint table.

mod client;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use coderunner_core::types::JobOptions;

/// CLI client for the coderunnerd batch-execution daemon.
#[derive(Parser)]
#[command(name = "coderunnerctl")]
#[command(about = "Control plane for the coderunner batch-execution daemon")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:8080)
    #[arg(long, global = true, env = "CODERUNNER_ADDR")]
    addr: Option<String>,

    /// Bearer token for daemon API (obtained from `login`)
    #[arg(long, global = true, env = "CODERUNNER_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Authenticate against the daemon and print a bearer token
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Confirm the current token is still valid and advise discarding it
    Logout,
    /// Repository registry operations
    #[command(subcommand)]
    Repo(RepoCommand),
    /// Job lifecycle operations
    #[command(subcommand)]
    Job(JobCommand),
    /// Probe daemon liveness
    Health,
}

#[derive(Subcommand)]
enum RepoCommand {
    /// List all registered repositories
    List,
    /// Show metadata for a single repository
    Show { name: String },
    /// Register a new repository (starts a background clone)
    Register {
        name: String,
        git_url: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        index_aware: bool,
    },
    /// Unregister a repository (fails if live jobs reference it)
    Unregister { name: String },
}

#[derive(Subcommand)]
enum JobCommand {
    /// Create a job against a registered repository (does not start it)
    Create {
        repository: String,
        prompt: String,
        #[arg(long, default_value_t = true)]
        pre_update: bool,
        #[arg(long, default_value_t = true)]
        build_index: bool,
        #[arg(long, default_value_t = 600)]
        timeout_seconds: u32,
    },
    /// Admit a created job onto the queue
    Start { job_id: String },
    /// List jobs owned by the authenticated principal
    List,
    /// Show full details of a job
    Show { job_id: String },
    /// Cancel a queued or running job
    Cancel { job_id: String },
    /// Delete a terminal job and reclaim its workspace
    Delete { job_id: String },
    /// Upload a file into a job's staging area before it starts
    UploadFile {
        job_id: String,
        path: PathBuf,
        #[arg(long)]
        overwrite: bool,
    },
    /// Upload an image attachment into a job's staging area before it starts
    UploadImage { job_id: String, path: PathBuf },
    /// List files in the job's workspace
    Files {
        job_id: String,
        #[arg(long, default_value = "")]
        path: String,
        #[arg(long)]
        mask: Option<String>,
        /// Restrict the listing to "files" (default) or "directories"
        #[arg(long = "type")]
        entry_type: Option<String>,
        /// Recurse this many additional levels below `path`
        #[arg(long)]
        depth: Option<u32>,
    },
    /// Read a UTF-8 text file from the job's workspace
    Cat { job_id: String, path: String },
    /// Download a file from the job's workspace to a local path
    Download {
        job_id: String,
        path: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let addr = cli.addr.unwrap_or_else(|| "http://127.0.0.1:8080".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    match run(client, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(client: Client, command: Command) -> Result<(), ClientError> {
    match command {
        Command::Login { username, password } => {
            let resp = client.login(&username, &password).await?;
            println!("{}", resp.token);
            eprintln!("logged in as {} (expires {})", resp.username, resp.expires);
        }
        Command::Logout => {
            client.logout().await?;
            println!("logged out (token remains valid until it expires; discard it locally)");
        }
        Command::Repo(cmd) => run_repo(&client, cmd).await?,
        Command::Job(cmd) => run_job(&client, cmd).await?,
        Command::Health => {
            let health = client.health().await?;
            println!("{} (v{}) at {}", health.status, health.version, health.timestamp);
        }
    }
    Ok(())
}

async fn run_repo(client: &Client, cmd: RepoCommand) -> Result<(), ClientError> {
    match cmd {
        RepoCommand::List => {
            let repos = client.list_repositories().await?;
            render::print_repository_list(&repos);
        }
        RepoCommand::Show { name } => {
            let repo = client.get_repository(&name).await?;
            render::print_repository_details(&repo);
        }
        RepoCommand::Register { name, git_url, description, index_aware } => {
            let repo = client
                .register_repository(&name, &git_url, description.as_deref(), Some(index_aware))
                .await?;
            println!("Registering '{}' (state: {})", repo.name, repo.clone_state.as_str());
        }
        RepoCommand::Unregister { name } => {
            let resp = client.unregister_repository(&name).await?;
            println!("{}", resp.message);
        }
    }
    Ok(())
}

async fn run_job(client: &Client, cmd: JobCommand) -> Result<(), ClientError> {
    match cmd {
        JobCommand::Create { repository, prompt, pre_update, build_index, timeout_seconds } => {
            let options = JobOptions { pre_update, build_index, timeout_seconds };
            let resp = client.create_job(&repository, &prompt, options).await?;
            render::print_job_created(&resp.job_id, &resp.status, &resp.cow_path);
        }
        JobCommand::Start { job_id } => {
            let resp = client.start_job(&job_id).await?;
            println!("status: {}", resp.status);
            if let Some(pos) = resp.queue_position {
                println!("queue position: {pos}");
            }
        }
        JobCommand::List => {
            let jobs = client.list_jobs().await?;
            render::print_job_list(&jobs);
        }
        JobCommand::Show { job_id } => {
            let job = client.get_job(&job_id).await?;
            render::print_job_details(&job);
        }
        JobCommand::Cancel { job_id } => {
            let resp = client.cancel_job(&job_id).await?;
            println!("cancelled: {}", resp.success);
        }
        JobCommand::Delete { job_id } => {
            let resp = client.delete_job(&job_id).await?;
            println!(
                "deleted (terminated: {}, workspace removed: {})",
                resp.terminated, resp.workspace_removed
            );
        }
        JobCommand::UploadFile { job_id, path, overwrite } => {
            let resp = client.upload_file(&job_id, &path, overwrite).await?;
            println!(
                "uploaded '{}' ({} bytes, overwritten: {})",
                resp.filename, resp.file_size, resp.overwritten
            );
        }
        JobCommand::UploadImage { job_id, path } => {
            let resp = client.upload_image(&job_id, &path).await?;
            println!("uploaded image '{}' -> {}", resp.filename, resp.path);
        }
        JobCommand::Files { job_id, path, mask, entry_type, depth } => {
            let files = client
                .list_files(&job_id, &path, mask.as_deref(), entry_type.as_deref(), depth)
                .await?;
            println!("{}", serde_json::to_string_pretty(&files).unwrap_or_default());
        }
        JobCommand::Cat { job_id, path } => {
            let content = client.read_file_content(&job_id, &path).await?;
            print!("{}", content.content);
        }
        JobCommand::Download { job_id, path, out } => {
            let bytes = client.download_file(&job_id, &path).await?;
            tokio::fs::write(&out, &bytes)
                .await
                .map_err(|e| ClientError::IoError(e.to_string()))?;
            println!("downloaded {} bytes to {}", bytes.len(), out.display());
        }
    }
    Ok(())
}
