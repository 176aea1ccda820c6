#![forbid(unsafe_code)]

//! `agent-conductor-ctl` - local CLI companion for `agent-conductor`.
//!
//! Connects to the IPC socket, sends one command, and prints the response
//! payload as pretty JSON. `watch` instead follows sessions over a
//! reconnecting push connection and prints every frame as one JSON line.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_conductor::bridge::reconnect::{PushClient, ReconnectPolicy};
use agent_conductor::ipc::client::{IpcClient, IpcConnector};
use agent_conductor::ipc::protocol::{CommandInput, IpcRequest};
use agent_conductor::models::activity::ActivityStatus;
use agent_conductor::models::budget::Budget;
use agent_conductor::models::command_queue::{CommandEdit, QueueStatus, SessionMode};
use agent_conductor::models::session_group::{GroupStatus, SessionSpec};
use agent_conductor::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "agent-conductor-ctl",
    about = "Local CLI for the agent-conductor server",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "agent-conductor")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage session groups.
    #[command(subcommand)]
    Group(GroupCommand),

    /// Manage command queues.
    #[command(subcommand)]
    Queue(QueueCommand),

    /// List tracked session activity.
    Activity {
        /// Only sessions with this status: `working`, `waiting_user_response` or `idle`.
        #[arg(long)]
        status: Option<String>,
        /// Only sessions in this project.
        #[arg(long)]
        project_path: Option<String>,
    },

    /// Follow sessions and print pushed frames until every one closes.
    Watch {
        /// Sessions to follow.
        #[arg(required = true)]
        session_ids: Vec<String>,
        /// Delay before the first reconnect attempt.
        #[arg(long, default_value_t = 1000)]
        base_delay_ms: u64,
        /// Upper bound on a single reconnect delay.
        #[arg(long, default_value_t = 30_000)]
        max_delay_ms: u64,
        /// Attempts before giving up.
        #[arg(long, default_value_t = 10)]
        max_attempts: u32,
    },
}

#[derive(Debug, Subcommand)]
enum GroupCommand {
    /// Create a group, optionally loading specs from a JSON array file.
    Create {
        /// Group name.
        name: String,
        /// Concurrency cap.
        #[arg(long)]
        max_concurrent: Option<u32>,
        /// JSON file holding an array of session specs.
        #[arg(long)]
        specs: Option<PathBuf>,
    },
    /// Add a session spec.
    AddSession {
        /// Target group.
        group_id: String,
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Make one spec wait for another.
    AddDependency {
        /// Target group.
        group_id: String,
        /// Spec gaining the dependency.
        spec_id: String,
        /// Spec it waits for.
        depends_on: String,
    },
    /// Start scheduling.
    Run {
        /// Target group.
        group_id: String,
        /// Skip unstarted specs after the first failure.
        #[arg(long)]
        fail_fast: Option<bool>,
    },
    /// Suspend admission of new sessions.
    Pause {
        /// Target group.
        group_id: String,
    },
    /// Resume admission.
    Resume {
        /// Target group.
        group_id: String,
    },
    /// Show one group.
    Status {
        /// Target group.
        group_id: String,
    },
    /// List groups.
    List {
        /// Only groups with this status.
        #[arg(long)]
        status: Option<String>,
    },
    /// Delete a group that is not running.
    Delete {
        /// Target group.
        group_id: String,
    },
}

#[derive(Debug, Args)]
struct SpecArgs {
    /// Spec id, unique within the group.
    #[arg(long)]
    id: String,
    /// Project directory.
    #[arg(long)]
    project_path: String,
    /// Prompt text.
    #[arg(long)]
    prompt: String,
    /// Specs that must complete first.
    #[arg(long)]
    depends_on: Vec<String>,
    #[command(flatten)]
    budget: BudgetArgs,
}

#[derive(Debug, Args)]
struct BudgetArgs {
    /// Cost ceiling in US dollars.
    #[arg(long)]
    max_budget_usd: Option<f64>,
    /// Turn ceiling.
    #[arg(long)]
    max_turns: Option<u32>,
}

impl BudgetArgs {
    fn budget(&self) -> Option<Budget> {
        if self.max_budget_usd.is_none() && self.max_turns.is_none() {
            return None;
        }
        Some(Budget {
            max_budget_usd: self.max_budget_usd,
            max_turns: self.max_turns,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Mode {
    New,
    Continue,
}

impl From<Mode> for SessionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::New => Self::New,
            Mode::Continue => Self::Continue,
        }
    }
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// Create an empty queue.
    Create {
        /// Queue name.
        name: String,
        /// Project every command runs in.
        project_path: String,
    },
    /// Append a command.
    Add {
        /// Target queue.
        queue_id: String,
        /// Prompt text.
        prompt: String,
        /// Reuse the previous session or start a new one.
        #[arg(long, value_enum, default_value_t = Mode::New)]
        mode: Mode,
        #[command(flatten)]
        budget: BudgetArgs,
    },
    /// Edit a pending command.
    Update {
        /// Target queue.
        queue_id: String,
        /// Command to edit.
        command_id: String,
        /// Replacement prompt.
        #[arg(long)]
        prompt: Option<String>,
        /// Replacement session mode.
        #[arg(long, value_enum)]
        mode: Option<Mode>,
        #[command(flatten)]
        budget: BudgetArgs,
    },
    /// Remove a pending command.
    Remove {
        /// Target queue.
        queue_id: String,
        /// Command to remove.
        command_id: String,
    },
    /// Start executing.
    Run {
        /// Target queue.
        queue_id: String,
        /// Stop the queue when a command fails.
        #[arg(long)]
        stop_on_failure: Option<bool>,
    },
    /// Pause after the in-flight command.
    Pause {
        /// Target queue.
        queue_id: String,
    },
    /// Resume a paused queue.
    Resume {
        /// Target queue.
        queue_id: String,
    },
    /// Stop, skipping every pending command.
    Stop {
        /// Target queue.
        queue_id: String,
    },
    /// Show one queue.
    Status {
        /// Target queue.
        queue_id: String,
    },
    /// List queues.
    List {
        /// Only queues with this status.
        #[arg(long)]
        status: Option<String>,
    },
    /// Delete a queue that is not running.
    Delete {
        /// Target queue.
        queue_id: String,
    },
}

fn main() {
    let args = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(&args)) {
        eprintln!("Error: {err}");
        if matches!(err, AppError::Ipc(ref msg) if msg.starts_with("failed to connect")) {
            eprintln!("Is agent-conductor running with ipc_name '{}'?", args.ipc_name);
        }
        std::process::exit(1);
    }
}

async fn run(args: &Cli) -> Result<()> {
    let request = match &args.command {
        Command::Group(command) => group_request(command)?,
        Command::Queue(command) => queue_request(command)?,
        Command::Activity {
            status,
            project_path,
        } => IpcRequest::Activity {
            status: status.as_deref().map(ActivityStatus::parse).transpose()?,
            project_path: project_path.clone(),
        },
        Command::Watch {
            session_ids,
            base_delay_ms,
            max_delay_ms,
            max_attempts,
        } => {
            let policy = ReconnectPolicy::new(
                Duration::from_millis(*base_delay_ms),
                Duration::from_millis(*max_delay_ms),
                *max_attempts,
            );
            return watch(&args.ipc_name, session_ids, policy).await;
        }
    };

    let mut client = IpcClient::connect(&args.ipc_name).await?;
    let data = client.request(&request).await?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

fn group_request(command: &GroupCommand) -> Result<IpcRequest> {
    let request = match command {
        GroupCommand::Create {
            name,
            max_concurrent,
            specs,
        } => {
            let specs: Vec<SessionSpec> = match specs {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => Vec::new(),
            };
            IpcRequest::CreateGroup {
                name: name.clone(),
                max_concurrent: *max_concurrent,
                specs,
            }
        }
        GroupCommand::AddSession { group_id, spec } => {
            let mut built = SessionSpec::new(&spec.id, &spec.project_path, &spec.prompt)
                .depends_on(spec.depends_on.iter().cloned());
            if let Some(budget) = spec.budget.budget() {
                built = built.with_budget(budget);
            }
            IpcRequest::AddSession {
                group_id: group_id.clone(),
                spec: built,
            }
        }
        GroupCommand::AddDependency {
            group_id,
            spec_id,
            depends_on,
        } => IpcRequest::AddDependency {
            group_id: group_id.clone(),
            spec_id: spec_id.clone(),
            depends_on: depends_on.clone(),
        },
        GroupCommand::Run {
            group_id,
            fail_fast,
        } => IpcRequest::RunGroup {
            group_id: group_id.clone(),
            fail_fast: *fail_fast,
        },
        GroupCommand::Pause { group_id } => IpcRequest::PauseGroup {
            group_id: group_id.clone(),
        },
        GroupCommand::Resume { group_id } => IpcRequest::ResumeGroup {
            group_id: group_id.clone(),
        },
        GroupCommand::Status { group_id } => IpcRequest::GetGroup {
            group_id: group_id.clone(),
        },
        GroupCommand::List { status } => IpcRequest::ListGroups {
            status: status.as_deref().map(GroupStatus::parse).transpose()?,
        },
        GroupCommand::Delete { group_id } => IpcRequest::DeleteGroup {
            group_id: group_id.clone(),
        },
    };
    Ok(request)
}

fn queue_request(command: &QueueCommand) -> Result<IpcRequest> {
    let request = match command {
        QueueCommand::Create { name, project_path } => IpcRequest::CreateQueue {
            name: name.clone(),
            project_path: project_path.clone(),
            commands: Vec::new(),
        },
        QueueCommand::Add {
            queue_id,
            prompt,
            mode,
            budget,
        } => IpcRequest::AddCommand {
            queue_id: queue_id.clone(),
            input: CommandInput {
                prompt: prompt.clone(),
                session_mode: (*mode).into(),
                budget: budget.budget(),
            },
        },
        QueueCommand::Update {
            queue_id,
            command_id,
            prompt,
            mode,
            budget,
        } => IpcRequest::UpdateCommand {
            queue_id: queue_id.clone(),
            command_id: command_id.clone(),
            edit: CommandEdit {
                prompt: prompt.clone(),
                session_mode: mode.map(Into::into),
                budget: budget.budget(),
            },
        },
        QueueCommand::Remove {
            queue_id,
            command_id,
        } => IpcRequest::RemoveCommand {
            queue_id: queue_id.clone(),
            command_id: command_id.clone(),
        },
        QueueCommand::Run {
            queue_id,
            stop_on_failure,
        } => IpcRequest::RunQueue {
            queue_id: queue_id.clone(),
            stop_on_failure: *stop_on_failure,
        },
        QueueCommand::Pause { queue_id } => IpcRequest::PauseQueue {
            queue_id: queue_id.clone(),
        },
        QueueCommand::Resume { queue_id } => IpcRequest::ResumeQueue {
            queue_id: queue_id.clone(),
        },
        QueueCommand::Stop { queue_id } => IpcRequest::StopQueue {
            queue_id: queue_id.clone(),
        },
        QueueCommand::Status { queue_id } => IpcRequest::GetQueue {
            queue_id: queue_id.clone(),
        },
        QueueCommand::List { status } => IpcRequest::ListQueues {
            status: status.as_deref().map(QueueStatus::parse).transpose()?,
        },
        QueueCommand::Delete { queue_id } => IpcRequest::DeleteQueue {
            queue_id: queue_id.clone(),
        },
    };
    Ok(request)
}

/// Print frames for `session_ids` until each has closed.
async fn watch(ipc_name: &str, session_ids: &[String], policy: ReconnectPolicy) -> Result<()> {
    let (client, _handle) = PushClient::new(
        Box::new(IpcConnector::new(ipc_name)),
        policy,
        session_ids.iter().cloned(),
    );
    let cancel = CancellationToken::new();
    let (frames_tx, mut frames_rx) = mpsc::channel(256);
    let driver = tokio::spawn(client.run(frames_tx, cancel.clone()));

    let mut open: BTreeSet<&str> = session_ids.iter().map(String::as_str).collect();
    while let Some(frame) = frames_rx.recv().await {
        println!("{}", serde_json::to_string(&frame)?);
        if frame.is_close() {
            open.remove(frame.session_id.as_str());
            if open.is_empty() {
                break;
            }
        }
    }

    cancel.cancel();
    drop(frames_rx);
    let state = driver
        .await
        .map_err(|err| AppError::Ipc(format!("push client task failed: {err}")))?;
    if !open.is_empty() {
        return Err(AppError::Ipc(format!(
            "push connection ended with {} session(s) still open ({state:?})",
            open.len()
        )));
    }
    Ok(())
}
