//! Switchboard CLI — operator commands for the agent orchestration engine.
//!
//! Every command opens the shared SQLite store, wires the same core
//! services the daemon uses, runs one operation and prints JSON.

mod commands;

use clap::{Parser, Subcommand};

/// Switchboard — multi-agent marketing task and workflow orchestration
#[derive(Parser)]
#[command(name = "switchboard", version, about = "Switchboard — multi-agent task and workflow orchestration")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "SWITCHBOARD_DB_PATH", default_value = "switchboard.db")]
    db: String,

    /// Path to an engine configuration YAML file
    #[arg(long, env = "SWITCHBOARD_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted (orchestrator cycle and sweeps)
    Run,

    /// Process pending orchestrator tasks once and exit
    Cycle,

    /// Manage agent tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Manage workflow instances and definitions
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Manage the approval queue
    Approval {
        #[command(subcommand)]
        action: ApprovalAction,
    },

    /// Run a maintenance sweep once
    Sweep {
        #[command(subcommand)]
        action: SweepAction,
    },

    /// Inspect and trigger scheduled jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List tasks, newest first
    List {
        /// Only tasks assigned to this agent
        #[arg(long)]
        agent: Option<String>,
        /// Only tasks in this status: pending, in_progress, complete, failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Pending tasks for an agent in the order it would process them
    Pending {
        #[arg(long)]
        agent: String,
    },
    /// Get a task by ID
    Get {
        #[arg(long)]
        id: String,
    },
    /// Create a task for an agent
    Create {
        /// Target agent (e.g. content, seo, paid_media)
        #[arg(long)]
        agent: String,
        /// Task type (e.g. write_blog_post)
        #[arg(long = "type")]
        task_type: String,
        /// Payload as a JSON object
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Priority, 1 (highest) to 5 (lowest)
        #[arg(long, default_value_t = 3)]
        priority: u8,
        #[arg(long, default_value = "operator")]
        created_by: String,
    },
    /// Mark a task complete with a result
    Complete {
        #[arg(long)]
        id: String,
        /// Result as a JSON object
        #[arg(long, default_value = "{}")]
        result: String,
    },
    /// Record a failed attempt (retried under the configured policy)
    Fail {
        #[arg(long)]
        id: String,
        #[arg(long)]
        error: String,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Start a workflow instance
    Start {
        /// Workflow type (e.g. new_blog_post)
        #[arg(long = "type")]
        workflow_type: String,
        /// Workflow context as a JSON object
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Show an instance
    Status {
        #[arg(long)]
        id: String,
    },
    /// List instances
    List {
        /// Only instances in this status: running, paused, completed, failed
        #[arg(long)]
        status: Option<String>,
    },
    /// Pause a running instance
    Pause {
        #[arg(long)]
        id: String,
    },
    /// Resume a paused instance and dispatch its next step
    Resume {
        #[arg(long)]
        id: String,
    },
    /// Dispatch the next step of a running instance
    Advance {
        #[arg(long)]
        id: String,
    },
    /// List registered workflow definitions
    Definitions,
    /// Validate a workflow definition YAML file
    Validate {
        file: String,
    },
}

#[derive(Subcommand)]
enum ApprovalAction {
    /// Pending approvals, highest priority first
    List,
    /// Get an approval by ID
    Get {
        #[arg(long)]
        id: String,
    },
    /// Submit an item for review
    Create {
        /// Approval type (e.g. blog_post, ad_copy)
        #[arg(long = "type")]
        approval_type: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        summary: String,
        /// Content under review as a JSON object
        #[arg(long, default_value = "{}")]
        content: String,
        /// Task whose workflow step this approval gates
        #[arg(long)]
        task_id: Option<String>,
        #[arg(long, default_value_t = 3)]
        priority: u8,
        #[arg(long, default_value = "operator")]
        created_by: String,
    },
    /// Record a reviewer decision: approved, rejected or revision_requested
    Resolve {
        #[arg(long)]
        id: String,
        #[arg(long)]
        status: String,
        #[arg(long)]
        reviewer: String,
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Record that a reminder was sent for a pending item
    Reminded {
        #[arg(long)]
        id: String,
    },
    /// Put a revision-requested item back into review
    Resubmit {
        #[arg(long)]
        id: String,
        /// Revised content as a JSON object
        #[arg(long)]
        content: Option<String>,
    },
}

#[derive(Subcommand)]
enum SweepAction {
    /// Report running workflows idle past the stalled threshold
    Stalled,
    /// Send reminders for approvals waiting past the reminder threshold
    Approvals,
}

#[derive(Subcommand)]
enum JobsAction {
    /// Show registered jobs and their last run
    List,
    /// Run a job immediately
    RunNow {
        name: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard_core=info,switchboard_cli=info".into()),
        )
        .init();

    let Some(command) = cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        return;
    };

    let state = commands::init_state(&cli.db, cli.config.as_deref()).await;

    let result = match command {
        Commands::Run => commands::run::run(&state).await,

        Commands::Cycle => commands::run::cycle(&state).await,

        Commands::Task { action } => match action {
            TaskAction::List { agent, status, limit } => {
                commands::task::list(&state, agent.as_deref(), status.as_deref(), limit).await
            }
            TaskAction::Pending { agent } => commands::task::pending(&state, &agent).await,
            TaskAction::Get { id } => commands::task::get(&state, &id).await,
            TaskAction::Create {
                agent,
                task_type,
                payload,
                priority,
                created_by,
            } => commands::task::create(&state, &agent, &task_type, &payload, priority, &created_by).await,
            TaskAction::Complete { id, result } => commands::task::complete(&state, &id, &result).await,
            TaskAction::Fail { id, error } => commands::task::fail(&state, &id, &error).await,
        },

        Commands::Workflow { action } => match action {
            WorkflowAction::Start { workflow_type, payload } => {
                commands::workflow::start(&state, &workflow_type, &payload).await
            }
            WorkflowAction::Status { id } => commands::workflow::status(&state, &id).await,
            WorkflowAction::List { status } => commands::workflow::list(&state, status.as_deref()).await,
            WorkflowAction::Pause { id } => commands::workflow::pause(&state, &id).await,
            WorkflowAction::Resume { id } => commands::workflow::resume(&state, &id).await,
            WorkflowAction::Advance { id } => commands::workflow::advance(&state, &id).await,
            WorkflowAction::Definitions => commands::workflow::definitions(&state),
            WorkflowAction::Validate { file } => commands::workflow::validate(&file),
        },

        Commands::Approval { action } => match action {
            ApprovalAction::List => commands::approval::list(&state).await,
            ApprovalAction::Get { id } => commands::approval::get(&state, &id).await,
            ApprovalAction::Create {
                approval_type,
                title,
                summary,
                content,
                task_id,
                priority,
                created_by,
            } => {
                commands::approval::create(
                    &state,
                    &approval_type,
                    &title,
                    &summary,
                    &content,
                    task_id.as_deref(),
                    priority,
                    &created_by,
                )
                .await
            }
            ApprovalAction::Resolve {
                id,
                status,
                reviewer,
                feedback,
            } => commands::approval::resolve(&state, &id, &status, &reviewer, feedback).await,
            ApprovalAction::Reminded { id } => commands::approval::reminded(&state, &id).await,
            ApprovalAction::Resubmit { id, content } => {
                commands::approval::resubmit(&state, &id, content.as_deref()).await
            }
        },

        Commands::Sweep { action } => match action {
            SweepAction::Stalled => commands::sweep::stalled(&state).await,
            SweepAction::Approvals => commands::sweep::approvals(&state).await,
        },

        Commands::Jobs { action } => match action {
            JobsAction::List => commands::jobs::list(&state).await,
            JobsAction::RunNow { name } => commands::jobs::run_now(&state, &name).await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
