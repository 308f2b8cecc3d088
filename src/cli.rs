//! CLI interface for ace-service

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;

use crate::config::{self, Config};
use crate::prompt;
use crate::retrieval;
use crate::server::AppState;
use crate::store::PlaybookStore;
use crate::types::{Bullet, LearnJob, LearnRequest};

#[derive(Parser)]
#[command(name = "ace-service")]
#[command(about = "Playbook learning service for LLM agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Inspect or initialise the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Manage playbooks
    Playbooks {
        #[command(subcommand)]
        command: PlaybookCommands,
    },
    /// Manage bullets in a playbook
    Bullets {
        #[command(subcommand)]
        command: BulletCommands,
    },
    /// Print a prompt with the most relevant bullets embedded
    Embed {
        /// Playbook ID
        playbook: String,
        /// Prompt text
        prompt: String,
        /// Number of bullets to embed
        #[arg(short)]
        k: Option<usize>,
    },
    /// Run or inspect learn jobs
    Learn {
        #[command(subcommand)]
        command: LearnCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default config file if none exists
    Init,
}

#[derive(Subcommand)]
enum PlaybookCommands {
    /// List all playbooks
    List,
    /// Create a playbook
    Create {
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
        /// Description
        #[arg(short, long)]
        description: Option<String>,
    },
}

#[derive(Subcommand)]
enum BulletCommands {
    /// List bullets with their counters
    List {
        /// Playbook ID
        playbook: String,
    },
    /// Add a bullet by hand
    Add {
        /// Playbook ID
        playbook: String,
        /// Bullet text
        content: String,
    },
}

#[derive(Subcommand)]
enum LearnCommands {
    /// Learn from one agent run and wait for the job to finish
    Start {
        /// Playbook ID
        playbook: String,
        /// The user message the agent was given
        #[arg(short, long)]
        user_message: String,
        /// File holding the agent's trajectory
        #[arg(short, long)]
        trajectory: std::path::PathBuf,
        /// Execution feedback for the run
        #[arg(short, long)]
        evaluation: Option<String>,
        /// Expected answer, if known
        #[arg(short, long)]
        ground_truth: Option<String>,
        /// Seconds to wait for the job
        #[arg(short, long, default_value = "600")]
        wait: u64,
    },
    /// Show the state of a learn job
    Status {
        /// Playbook ID
        playbook: String,
        /// Learn job ID
        job: String,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = Config::load()?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            crate::server::start(config).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                config::show_config(&Config::load()?)?;
            }
            ConfigCommands::Init => {
                let path = config::config_path()?;
                if path.exists() {
                    println!("Config already exists at {}", path.display());
                } else {
                    Config::default().save_to(&path)?;
                    println!("Wrote default config to {}", path.display());
                }
            }
        },
        Commands::Playbooks { command } => {
            let store = open_store(&Config::load()?).await?;
            match command {
                PlaybookCommands::List => {
                    let playbooks = store.list_playbooks().await?;
                    if playbooks.is_empty() {
                        println!("No playbooks yet.");
                    }
                    for playbook in playbooks {
                        println!(
                            "{}  {}  {}",
                            playbook.id,
                            playbook.name.as_deref().unwrap_or("-"),
                            playbook.description.as_deref().unwrap_or("")
                        );
                    }
                }
                PlaybookCommands::Create { name, description } => {
                    let playbook = store.create_playbook(name, description).await?;
                    println!("Created playbook {}", playbook.id);
                }
            }
        }
        Commands::Bullets { command } => {
            let store = open_store(&Config::load()?).await?;
            match command {
                BulletCommands::List { playbook } => {
                    store
                        .get_playbook(&playbook)
                        .await?
                        .with_context(|| format!("Playbook {} not found", playbook))?;
                    let bullets = store.list_bullets(&playbook).await?;
                    print_bullets(&bullets);
                }
                BulletCommands::Add { playbook, content } => {
                    store.get_or_create_playbook(&playbook).await?;
                    let bullet = store.create_bullet(&playbook, &content).await?;
                    println!("Added bullet {}", bullet.id);
                }
            }
        }
        Commands::Embed { playbook, prompt, k } => {
            let config = Config::load()?;
            let store = open_store(&config).await?;
            store.get_or_create_playbook(&playbook).await?;
            let bullets = store.list_bullets(&playbook).await?;
            let retrieved = retrieval::rank(&bullets, &prompt, k.unwrap_or(config.learning.default_k));
            println!("{}", prompt::embed(&prompt, &retrieved));
        }
        Commands::Learn { command } => {
            let config = Config::load()?;
            let store = open_store(&config).await?;
            match command {
                LearnCommands::Start {
                    playbook,
                    user_message,
                    trajectory,
                    evaluation,
                    ground_truth,
                    wait,
                } => {
                    let trajectory = tokio::fs::read_to_string(&trajectory)
                        .await
                        .with_context(|| format!("Failed to read {}", trajectory.display()))?;
                    let request = LearnRequest {
                        evaluation,
                        ground_truth,
                        ..LearnRequest::new(user_message, trajectory)
                    };

                    let state = AppState::build(store, &config);
                    let job = state.orchestrator.start_learn(&playbook, request).await?;
                    println!("Learn job {} queued", job.id);

                    let result = state
                        .orchestrator
                        .wait_for_job(&playbook, &job.id, Duration::from_secs(wait))
                        .await;
                    state.orchestrator.shutdown().await;
                    print_job(&result?);
                }
                LearnCommands::Status { playbook, job } => {
                    let job = store
                        .get_job(&playbook, &job)
                        .await?
                        .with_context(|| format!("Learn job {} not found in {}", job, playbook))?;
                    print_job(&job);
                }
            }
        }
    }

    Ok(())
}

async fn open_store(config: &Config) -> Result<PlaybookStore> {
    let path = config.database_path()?;
    PlaybookStore::open(&path)
        .await
        .with_context(|| format!("Failed to open database at {}", path.display()))
}

fn print_bullets(bullets: &[Bullet]) {
    if bullets.is_empty() {
        println!("Playbook is empty.");
        return;
    }
    for bullet in bullets {
        println!("{}", prompt::render_bullet(bullet));
    }
    println!("\n{} bullet(s)", bullets.len());
}

fn print_job(job: &LearnJob) {
    println!("Job:     {}", job.id);
    println!("Status:  {}", job.status);
    println!("Updated: {}", job.modified_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(error) = &job.error {
        println!("Error:   {}", error);
    }
    if let Some(reflection) = &job.reflection {
        println!("\nKey insight: {}", reflection.key_insight);
    }
    if let Some(curation) = &job.curation {
        println!("\nOperations ({}):", curation.operations.len());
        for op in &curation.operations {
            println!("  {} {}", op.kind(), op.bullet_id().unwrap_or(""));
        }
    }
}
