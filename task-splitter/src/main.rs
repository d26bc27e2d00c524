//! CLI for the task-splitter: task CRUD, search, guest transfer, profile
//! management, and the split workflow with status polling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use task_splitter::database::Database;
use task_splitter::decompose::OpenAiDecomposer;
use task_splitter::engine::WorkflowEngine;
use task_splitter::tasks::{TaskScope, TaskService};
use task_splitter::users::{ProfileService, ProfileUpdate};
use task_splitter_sdk::{
    PaginationOpts, RunHandle, StatusReport, Task, TaskOwner, SPLIT_TASK_DEFINITION,
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const POLL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "task-splitter", about = "Task list with an AI-assisted split workflow")]
struct Cli {
    /// Database path (default: ~/.task-splitter/tasks.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a task
    Add {
        text: String,
        /// Owner token to attribute the task to
        #[arg(long)]
        owner: Option<String>,
        /// Treat the owner token as a guest identity
        #[arg(long)]
        guest: bool,
    },
    /// Toggle a task's completion
    Toggle {
        id: i64,
        /// Mark incomplete instead of complete
        #[arg(long)]
        undo: bool,
    },
    /// List recent tasks
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Continue from a previous page's cursor
        #[arg(long)]
        cursor: Option<i64>,
        /// Only tasks owned by this account token
        #[arg(long)]
        mine: Option<String>,
        /// Only tasks held by this guest token
        #[arg(long)]
        guest_of: Option<String>,
    },
    /// Full-text search over task text
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        cursor: Option<i64>,
        #[arg(long)]
        mine: Option<String>,
        #[arg(long)]
        guest_of: Option<String>,
    },
    /// Split a task description into sub-tasks via the decomposition service
    Split {
        text: String,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        guest: bool,
        /// Print the handle and exit instead of polling to completion
        #[arg(long)]
        no_wait: bool,
    },
    /// Poll the status of a split run
    Status {
        handle: Uuid,
        /// Keep polling until the run reaches a terminal state
        #[arg(long)]
        wait: bool,
    },
    /// Claim every guest-held task for an account
    Transfer {
        guest_token: String,
        account_token: String,
    },
    /// Profile management
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Show the profile for an identity token
    Show { token: String },
    /// Update profile fields for an identity token
    Set {
        token: String,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        bio: Option<String>,
        /// Opaque storage reference for an uploaded avatar
        #[arg(long)]
        avatar: Option<String>,
        /// Mark onboarding as finished
        #[arg(long)]
        onboarded: bool,
    },
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".task-splitter")
        .join("tasks.db")
}

fn owner_from(token: Option<String>, guest: bool) -> Option<TaskOwner> {
    token.map(|token| {
        if guest {
            TaskOwner::Guest { token }
        } else {
            TaskOwner::Account { token }
        }
    })
}

fn scope_from(mine: Option<String>, guest_of: Option<String>) -> Result<TaskScope> {
    match (mine, guest_of) {
        (Some(_), Some(_)) => Err(anyhow!("--mine and --guest-of are mutually exclusive")),
        (Some(owner_token), None) => Ok(TaskScope::Mine { owner_token }),
        (None, Some(guest_token)) => Ok(TaskScope::Guest { guest_token }),
        (None, None) => Ok(TaskScope::Any),
    }
}

fn print_task(task: &Task) {
    let mark = if task.is_completed { "x" } else { " " };
    let owner = match (&task.owner_token, task.is_guest) {
        (Some(token), true) => format!(" (guest {})", token),
        (Some(token), false) => format!(" ({})", token),
        (None, _) => String::new(),
    };
    println!("[{}] #{} {}{}", mark, task.id, task.text, owner);
}

fn print_page(page: &task_splitter_sdk::Page<Task>) {
    for task in &page.items {
        print_task(task);
    }
    if let Some(cursor) = page.next_cursor {
        println!("-- more: --cursor {}", cursor);
    }
}

/// Poll a run handle until it reaches a terminal state.
async fn poll_to_terminal(engine: &WorkflowEngine, handle: &RunHandle) -> Result<StatusReport> {
    let started = std::time::Instant::now();
    loop {
        let report = engine.status(handle)?;
        if report.is_terminal() {
            return Ok(report);
        }
        if started.elapsed() > POLL_TIMEOUT {
            return Err(anyhow!("run {} still in progress after {:?}", handle.id, POLL_TIMEOUT));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let db_path = cli.db.unwrap_or_else(default_db_path);
    let database = Database::open(db_path).context("failed to open database")?;
    database.init_schema().context("failed to initialize schema")?;
    let db = database.into_shared();

    let engine = WorkflowEngine::new(db.clone(), Arc::new(OpenAiDecomposer::from_env()));
    let resumed = engine.recover()?;
    if resumed > 0 {
        tracing::info!(resumed, "resumed unfinished runs");
    }

    let tasks = TaskService::new(db.clone(), engine.clone());
    let profiles = ProfileService::new(db.clone());

    match cli.command {
        Command::Add { text, owner, guest } => {
            let task = tasks.create(&text, owner_from(owner, guest).as_ref())?;
            print_task(&task);
        }
        Command::Toggle { id, undo } => {
            let task = tasks.toggle(id, !undo)?;
            print_task(&task);
        }
        Command::List {
            limit,
            cursor,
            mine,
            guest_of,
        } => {
            let scope = scope_from(mine, guest_of)?;
            let opts = PaginationOpts {
                cursor,
                num_items: limit,
            };
            let page = tasks.search("", &scope, &opts)?;
            print_page(&page);
        }
        Command::Search {
            query,
            limit,
            cursor,
            mine,
            guest_of,
        } => {
            let scope = scope_from(mine, guest_of)?;
            let opts = PaginationOpts {
                cursor,
                num_items: limit,
            };
            let page = tasks.search(&query, &scope, &opts)?;
            print_page(&page);
        }
        Command::Split {
            text,
            owner,
            guest,
            no_wait,
        } => {
            let handle = tasks.split(&text, owner_from(owner, guest))?;
            println!("run {}", handle.id);
            if no_wait {
                return Ok(());
            }
            println!("splitting...");
            match poll_to_terminal(&engine, &handle).await? {
                StatusReport::Completed => {
                    let created = {
                        let db = db.lock().unwrap();
                        db.tasks_for_run(&handle.id)?
                    };
                    println!("completed: {} tasks created", created.len());
                    for task in &created {
                        print_task(task);
                    }
                }
                StatusReport::Failed { error } => {
                    println!("failed: {}", error);
                    std::process::exit(1);
                }
                StatusReport::InProgress => unreachable!("poll_to_terminal returns terminal states"),
            }
        }
        Command::Status { handle, wait } => {
            let handle = RunHandle::new(handle, SPLIT_TASK_DEFINITION.to_string());
            let report = if wait {
                poll_to_terminal(&engine, &handle).await?
            } else {
                engine.status(&handle)?
            };
            println!("{}", serde_json::to_string(&report)?);
            if let StatusReport::Failed { .. } = report {
                std::process::exit(1);
            }
        }
        Command::Transfer {
            guest_token,
            account_token,
        } => {
            let moved = tasks.transfer_guest_tasks(&guest_token, &account_token)?;
            println!("transferred {} tasks", moved);
        }
        Command::Profile { action } => match action {
            ProfileAction::Show { token } => match profiles.get_profile(&token)? {
                Some(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
                None => println!("no profile for {}", token),
            },
            ProfileAction::Set {
                token,
                first_name,
                last_name,
                location,
                bio,
                avatar,
                onboarded,
            } => {
                let mut profile = profiles.update_profile(
                    &token,
                    ProfileUpdate {
                        first_name,
                        last_name,
                        location,
                        bio,
                        avatar_blob: avatar,
                    },
                )?;
                if onboarded {
                    profiles.complete_onboarding(&token)?;
                    profile.onboarded = true;
                }
                println!("{}", serde_json::to_string_pretty(&profile)?);
            }
        },
    }

    Ok(())
}
