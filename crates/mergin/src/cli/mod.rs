//! Command-line interface for the sync engine.

mod client;
mod config;
mod progress;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mergin_core::api::{MerginApi, ProjectFilter};
use mergin_core::config::ApiConfig;
use mergin_core::local_projects::{split_full_name, InMemoryLocalProjects};

use client::ReqwestClient;
use config::CliConfig;

#[derive(Parser)]
#[command(name = "mergin")]
#[command(version)]
#[command(about = "Synchronize Mergin projects with a local directory", long_about = None)]
struct Cli {
    /// Config file location
    #[arg(short, long, global = true, default_value = "mergin.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store credentials and verify them against the server
    Login {
        /// Username or registered e-mail
        username: String,
    },

    /// List projects on the server
    List {
        /// Search expression on project names
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Download a project (or update it to the server version)
    Download {
        /// Project full name, namespace/name
        project: String,
    },

    /// Upload local changes (pulls first)
    Sync {
        /// Project full name, namespace/name
        project: String,
    },

    /// Show locally downloaded projects
    Status,

    /// Check server availability and API version
    Ping,
}

/// Entry point: parse arguments and run the chosen command.
pub fn run() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: could not start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(message) = runtime.block_on(dispatch(&cli)) {
        eprintln!("error: {}", message);
        std::process::exit(1);
    }
}

async fn dispatch(cli: &Cli) -> Result<(), String> {
    let mut cfg = CliConfig::load(&cli.config)?;

    match &cli.command {
        Commands::Login { username } => {
            let password = read_password(username)?;
            let api = build_api(&cfg)?;
            api.authorize(username, &password)
                .await
                .map_err(|e| e.to_string())?;

            cfg.username = Some(username.clone());
            cfg.password = Some(password);
            cfg.save(&cli.config)?;
            println!("Logged in as {}", username);
            Ok(())
        }

        Commands::List { filter } => {
            let api = authorized_api(&cfg).await?;
            let projects = api
                .list_projects(&ProjectFilter {
                    search: filter.clone(),
                    ..ProjectFilter::default()
                })
                .await
                .map_err(|e| e.to_string())?;

            for project in &projects {
                let local = api
                    .local_projects()
                    .project(&project.full_name())
                    .map(|info| format!(" (local v{})", info.local_version))
                    .unwrap_or_default();
                println!("{}  v{}{}", project.full_name(), project.version, local);
            }
            if projects.is_empty() {
                println!("No projects found");
            }
            Ok(())
        }

        Commands::Download { project } => {
            let (namespace, name) = parse_project(project)?;
            let api = authorized_api(&cfg).await?;
            let subscription = progress::attach(&api);
            cancel_on_ctrl_c(&api, project, false);

            let result = api.update_project(&namespace, &name).await;
            api.unsubscribe(subscription);
            let dir = result.map_err(|e| e.to_string())?;
            println!("{}", dir.display());
            Ok(())
        }

        Commands::Sync { project } => {
            let (namespace, name) = parse_project(project)?;
            let api = authorized_api(&cfg).await?;
            let subscription = progress::attach(&api);
            cancel_on_ctrl_c(&api, project, true);

            let result = api.upload_project(&namespace, &name).await;
            api.unsubscribe(subscription);
            result.map_err(|e| e.to_string())?;
            Ok(())
        }

        Commands::Status => {
            let api = build_api(&cfg)?;
            let mut entries = api.local_projects().all();
            entries.sort_by(|a, b| a.full_name().cmp(&b.full_name()));
            for info in &entries {
                println!(
                    "{}  v{}  {}",
                    info.full_name(),
                    info.local_version,
                    info.project_dir.display()
                );
            }
            if entries.is_empty() {
                println!("No local projects under {}", cfg.data_dir().display());
            }
            Ok(())
        }

        Commands::Ping => {
            let api = build_api(&cfg)?;
            let version = api.ping().await.map_err(|e| e.to_string())?;
            println!(
                "Server {} ({:?})",
                version,
                api.api_version_status()
            );
            Ok(())
        }
    }
}

fn build_api(cfg: &CliConfig) -> Result<MerginApi, String> {
    let api_config = match &cfg.api_root {
        Some(api_root) => ApiConfig::new(api_root.clone(), cfg.data_dir()),
        None => ApiConfig::public(cfg.data_dir()),
    };
    let client = ReqwestClient::new().map_err(|e| e.to_string())?;
    let local_projects = InMemoryLocalProjects::from_data_dir(&cfg.data_dir());
    Ok(MerginApi::new(
        api_config,
        Arc::new(client),
        Arc::new(local_projects),
    ))
}

async fn authorized_api(cfg: &CliConfig) -> Result<MerginApi, String> {
    let api = build_api(cfg)?;
    let (username, password) = match (&cfg.username, stored_password(cfg)) {
        (Some(username), Some(password)) => (username.clone(), password),
        _ => return Err("not logged in, run `mergin login <username>` first".to_string()),
    };
    api.authorize(&username, &password)
        .await
        .map_err(|e| e.to_string())?;
    Ok(api)
}

fn stored_password(cfg: &CliConfig) -> Option<String> {
    std::env::var("MERGIN_PASSWORD")
        .ok()
        .or_else(|| cfg.password.clone())
}

fn parse_project(source: &str) -> Result<(String, String), String> {
    split_full_name(source)
        .ok_or_else(|| format!("'{}' is not a namespace/name project reference", source))
}

fn read_password(username: &str) -> Result<String, String> {
    if let Ok(password) = std::env::var("MERGIN_PASSWORD") {
        return Ok(password);
    }
    eprint!("Password for {}: ", username);
    let _ = io::stderr().flush();
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| format!("could not read password: {}", e))?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Request cancellation of the running sync when the user hits Ctrl-C.
fn cancel_on_ctrl_c(api: &MerginApi, full_name: &str, upload: bool) {
    let api = api.clone();
    let full_name = full_name.to_string();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ncancelling {}...", full_name);
            if upload {
                api.upload_cancel(&full_name);
            } else {
                api.update_cancel(&full_name);
            }
        }
    });
}
