use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use formprobe::config::Config;
use formprobe::runner::FormConfig;
use formprobe::schedule::{Frequency, NewSchedule};

#[derive(Parser)]
#[command(
    name = "formprobe",
    about = "Self-hosted scheduler and runner for automated browser form tests",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + schedule sweep)
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a single form test immediately and print the result
    RunTest {
        /// Target page URL
        #[arg(long)]
        url: String,

        /// Path to a form config JSON file (fields, submit selector, indicator)
        #[arg(long)]
        form_config: String,

        /// Path to a user data JSON file (field name -> value)
        #[arg(long)]
        user_data: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Manage scheduled form tests
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all schedules
    List,

    /// Add a new schedule
    Add {
        /// Schedule name
        #[arg(long)]
        name: String,

        /// Target page URL
        #[arg(long)]
        url: String,

        /// Path to a form config JSON file
        #[arg(long)]
        form_config: String,

        /// Path to a user data JSON file
        #[arg(long)]
        user_data: Option<String>,

        /// Frequency: hourly, daily, weekly, monthly or custom
        #[arg(long, default_value = "daily")]
        frequency: String,

        /// Time of day as HH:MM (daily/weekly/monthly)
        #[arg(long)]
        at: Option<String>,

        /// Cron expression (6-field, required for custom frequency)
        #[arg(long)]
        cron: Option<String>,
    },

    /// Remove a schedule
    Remove {
        /// Schedule id
        #[arg(long)]
        id: Uuid,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(p) => Config::load(std::path::Path::new(p)),
        None => Ok(Config::load_or_default()),
    }
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.bind = bind;
            }
            tracing::info!(bind = %cfg.bind, "Starting FormProbe daemon");
            formprobe::serve(cfg).await?;
        }
        Commands::RunTest {
            url,
            form_config,
            user_data,
            json,
        } => {
            let form_config: FormConfig = read_json_file(&form_config)?;
            let user_data: HashMap<String, serde_json::Value> = match user_data {
                Some(p) => read_json_file(&p)?,
                None => HashMap::new(),
            };

            let pool = formprobe::storage::open_pool(&cfg.db_path)?;
            let state = formprobe::build_state(&cfg, pool)?;

            tracing::info!(%url, "Running form test");
            let record = state.runner.run(None, url, form_config, user_data).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("\nFormProbe Test Result");
                println!("Test ID:  {}", record.id);
                println!("URL:      {}", record.url);
                println!("Status:   {}", record.status);
                if let Some(m) = &record.metrics {
                    println!("Duration: {}ms", m.duration_ms);
                    println!(
                        "Fields:   {} processed, {} errors",
                        m.fields_processed, m.errors_count
                    );
                }
                if !record.errors.is_empty() {
                    println!("\nErrors:");
                    for e in &record.errors {
                        println!(" - {}", e);
                    }
                }
                if !record.screenshots.is_empty() {
                    println!("\nScreenshots:");
                    for (stage, path) in &record.screenshots {
                        println!(" - {}: {}", stage, path);
                    }
                }
                println!();
            }
        }
        Commands::Schedule { action } => {
            let pool = formprobe::storage::open_pool(&cfg.db_path)?;
            let state = formprobe::build_state(&cfg, pool)?;
            let manager = state.schedules;

            match action {
                ScheduleAction::List => {
                    let (list, _) = manager.list(100, None)?;
                    if list.is_empty() {
                        println!("No schedules found.");
                    } else {
                        println!(
                            "{:<36} | {:<20} | {:<8} | {:<6} | Next run",
                            "Id", "Name", "Freq", "Active"
                        );
                        println!(
                            "{:-<36}-|-{:-<20}-|-{:-<8}-|-{:-<6}-|-{:-<20}",
                            "", "", "", "", ""
                        );
                        for s in list {
                            let next = s
                                .next_run_time
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "-".into());
                            println!(
                                "{:<36} | {:<20} | {:<8} | {:<6} | {}",
                                s.id,
                                s.name,
                                s.frequency.as_str(),
                                s.active,
                                next
                            );
                        }
                    }
                }
                ScheduleAction::Add {
                    name,
                    url,
                    form_config,
                    user_data,
                    frequency,
                    at,
                    cron,
                } => {
                    let form_config: FormConfig = read_json_file(&form_config)?;
                    let user_data: HashMap<String, serde_json::Value> = match user_data {
                        Some(p) => read_json_file(&p)?,
                        None => HashMap::new(),
                    };
                    let frequency = Frequency::parse(&frequency)
                        .with_context(|| format!("unknown frequency '{}'", frequency))?;

                    let created = manager
                        .create(NewSchedule {
                            name,
                            description: None,
                            url,
                            form_config,
                            user_data,
                            frequency,
                            cron_expression: cron,
                            specific_time: at,
                            active: None,
                        })
                        .await?;
                    println!("Schedule '{}' added ({}).", created.name, created.id);
                }
                ScheduleAction::Remove { id } => {
                    manager.delete(id).await?;
                    println!("Schedule {} removed.", id);
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = manager.preview_next_runs(hours)?;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for (time, name) in preview {
                            println!("{} : {}", time.to_rfc3339(), name);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
