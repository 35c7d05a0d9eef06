//! vigil operator CLI.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use vigil::Config;
use vigil::cooldown::{ActionClass, CooldownEngine};
use vigil::db::{self, Database, EventFilter};
use vigil::event::EventLevel;
use vigil::memory::{MemoryCategory, MemoryEdit, MemoryFilter, MemoryService, ScopeFilter};
use vigil::session::{
    HubMessage, SessionView, StartRequest, Supervisor, Tier, TriggerKind,
};

#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Supervise infrastructure investigation sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a session and follow its output until it ends
    Start {
        /// Capability tier (1-3)
        #[arg(short, long, default_value_t = 1)]
        tier: u8,

        /// Instructions for the agent
        #[arg(short, long)]
        prompt: String,

        /// Model override (defaults to the tier's model)
        #[arg(short, long)]
        model: Option<String>,

        /// What triggered the session
        #[arg(long, default_value = "manual")]
        trigger: TriggerKind,

        /// Parent session when escalating
        #[arg(long)]
        parent: Option<Uuid>,

        /// Service the session is expected to remediate
        #[arg(long, requires = "action")]
        service: Option<String>,

        /// Remediation class (restart or redeploy)
        #[arg(long, requires = "service")]
        action: Option<ActionClass>,
    },

    /// List sessions, newest first
    Sessions {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(short, long, default_value_t = 0)]
        offset: usize,
    },

    /// Show a session and its rendered output
    Show {
        id: Uuid,
    },

    /// Attach a summary to a finished session
    Summarize {
        id: Uuid,

        summary: String,
    },

    /// List events, newest first
    Events {
        #[arg(long)]
        level: Option<EventLevel>,

        #[arg(long)]
        service: Option<String>,

        #[arg(long)]
        session: Option<Uuid>,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// List memories, highest confidence first
    Memories {
        /// Only this service ("general" for scope-less memories)
        #[arg(long)]
        service: Option<String>,

        #[arg(long)]
        category: Option<MemoryCategory>,

        /// Include inactive memories
        #[arg(long)]
        all: bool,
    },

    /// Manage memories by hand
    #[command(subcommand)]
    Memory(MemoryCommand),

    /// Show cooldown state for every service with history
    Cooldowns,

    /// Record a health evaluation for a service
    Health {
        service: String,

        #[arg(long, conflicts_with = "unhealthy")]
        healthy: bool,

        #[arg(long)]
        unhealthy: bool,
    },
}

impl Command {
    /// Commands that never write, and so may run beside `vigil start`.
    fn is_read_only(&self) -> bool {
        matches!(
            self,
            Command::Sessions { .. }
                | Command::Show { .. }
                | Command::Events { .. }
                | Command::Memories { .. }
                | Command::Cooldowns
        )
    }
}

#[derive(Subcommand, Debug)]
enum MemoryCommand {
    /// Add a memory
    Add {
        #[arg(long)]
        category: MemoryCategory,

        #[arg(long)]
        service: Option<String>,

        #[arg(long)]
        confidence: Option<f64>,

        observation: String,
    },

    /// Edit an existing memory
    Update {
        id: Uuid,

        #[arg(long)]
        observation: Option<String>,

        #[arg(long)]
        category: Option<MemoryCategory>,

        /// New service scope ("general" to clear it)
        #[arg(long)]
        service: Option<String>,

        #[arg(long)]
        confidence: Option<f64>,

        #[arg(long, conflicts_with = "deactivate")]
        activate: bool,

        #[arg(long)]
        deactivate: bool,
    },

    /// Delete a memory permanently
    Delete {
        id: Uuid,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;
    init_tracing(config.log_json);

    let store = if cli.command.is_read_only() {
        db::connect_read_only(&config).await
    } else {
        db::connect(&config).await
    }
    .with_context(|| format!("opening {} store", config.database.backend_name()))?;

    match cli.command {
        Command::Start {
            tier,
            prompt,
            model,
            trigger,
            parent,
            service,
            action,
        } => {
            let mut request = StartRequest::new(Tier::new(tier)?, prompt, trigger);
            if let Some(model) = model {
                request = request.with_model(model);
            }
            if let Some(parent) = parent {
                request = request.with_parent(parent);
            }
            if let (Some(service), Some(action)) = (service, action) {
                request = request.with_remediation(service, action);
            }
            run_session(store, &config, request).await
        }
        Command::Sessions { limit, offset } => list_sessions(store, limit, offset).await,
        Command::Show { id } => show_session(store, &config, id).await,
        Command::Summarize { id, summary } => {
            store.set_session_summary(id, summary.trim()).await?;
            println!("Summary saved for session {}", id);
            Ok(())
        }
        Command::Events {
            level,
            service,
            session,
            limit,
        } => {
            let filter = EventFilter {
                level,
                service,
                session_id: session,
                limit: Some(limit),
            };
            for event in store.list_events(&filter).await? {
                println!(
                    "{}  {:8}  {:12}  {}",
                    event.created_at.format("%Y-%m-%d %H:%M:%S"),
                    event.level,
                    event.service.as_deref().unwrap_or("general"),
                    event.message
                );
            }
            Ok(())
        }
        Command::Memories {
            service,
            category,
            all,
        } => {
            let scope = match service.as_deref().map(vigil::memory::normalize_service) {
                None => ScopeFilter::Any,
                Some(None) => ScopeFilter::General,
                Some(Some(s)) => ScopeFilter::Service(s),
            };
            let filter = MemoryFilter {
                scope,
                category,
                active_only: !all,
            };
            for memory in MemoryService::new(store).list(&filter).await? {
                println!(
                    "{}  {:.2}  {:8}  {:12}  [{}] {}",
                    memory.id,
                    memory.confidence,
                    if memory.active { "active" } else { "inactive" },
                    memory.service.as_deref().unwrap_or("general"),
                    memory.category,
                    memory.observation
                );
            }
            Ok(())
        }
        Command::Memory(cmd) => run_memory_command(store, cmd).await,
        Command::Cooldowns => {
            for summary in CooldownEngine::new(store).summaries().await? {
                println!(
                    "{:16}  restarts {}/{} ({})  redeploys {}/{} ({})  healthy streak {}",
                    summary.service,
                    summary.restarts_in_window,
                    ActionClass::Restart.limit(),
                    if summary.restart_permitted { "ok" } else { "cooling down" },
                    summary.redeploys_in_window,
                    ActionClass::Redeploy.limit(),
                    if summary.redeploy_permitted { "ok" } else { "cooling down" },
                    summary.consecutive_healthy
                );
            }
            Ok(())
        }
        Command::Health {
            service,
            healthy,
            unhealthy,
        } => {
            if healthy == unhealthy {
                anyhow::bail!("pass exactly one of --healthy or --unhealthy");
            }
            let record = CooldownEngine::new(store)
                .on_health_evaluation(&service, healthy)
                .await?;
            println!(
                "{}: healthy streak {}, {} restart(s) and {} redeploy(s) on record",
                record.service,
                record.consecutive_healthy,
                record.restarts.len(),
                record.redeploys.len()
            );
            Ok(())
        }
    }
}

async fn run_session(
    store: Arc<dyn Database>,
    config: &Config,
    request: StartRequest,
) -> anyhow::Result<()> {
    let supervisor = Supervisor::new(store, config.supervisor_config());
    let recovered = supervisor.recover_orphans().await?;
    if !recovered.is_empty() {
        eprintln!("Marked {} orphaned session(s) as failed", recovered.len());
    }

    let id = supervisor.start(request).await?;
    eprintln!("Session {}", id);

    let mut subscription = match supervisor.subscribe(id).await? {
        SessionView::Live(subscription) => subscription,
        SessionView::Replay { session, lines } => {
            // Finished before we could attach.
            for line in lines {
                println!("{}", line);
            }
            eprintln!("Session {} {}", id, session.status);
            return Ok(());
        }
    };

    loop {
        tokio::select! {
            message = subscription.next() => match message {
                Some(HubMessage::Line(line)) => println!("{}", line),
                Some(HubMessage::Closed(status)) => {
                    eprintln!("Session {} {}", id, status);
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted, cancelling session {}", id);
                let status = supervisor.cancel().await?;
                eprintln!("Session {} {}", id, status);
                break;
            }
        }
    }

    // The terminal write happens before the hub closes; wait for the slot too.
    supervisor.wait(id).await?;
    Ok(())
}

async fn list_sessions(
    store: Arc<dyn Database>,
    limit: usize,
    offset: usize,
) -> anyhow::Result<()> {
    for session in store.list_sessions(limit, offset).await? {
        println!(
            "{}  {}  tier {}  {:9}  {:10}  {}",
            session.id,
            session.started_at.format("%Y-%m-%d %H:%M:%S"),
            session.tier,
            session.status,
            session.trigger,
            session
                .cost_usd
                .map(|c| format!("${}", c.round_dp(4)))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn show_session(store: Arc<dyn Database>, config: &Config, id: Uuid) -> anyhow::Result<()> {
    let supervisor = Supervisor::new(store, config.supervisor_config());
    let (session, lines) = supervisor.replay(id).await?;

    println!("Session   {}", session.id);
    println!("Status    {}", session.status);
    println!("Tier      {} ({})", session.tier, session.model);
    println!("Trigger   {}", session.trigger);
    if let Some(parent) = session.parent_id {
        println!("Parent    {}", parent);
    }
    println!("Started   {}", session.started_at);
    if let Some(ended) = session.ended_at {
        println!("Ended     {}", ended);
    }
    if let Some(code) = session.exit_code {
        println!("Exit code {}", code);
    }
    if let Some(turns) = session.num_turns {
        println!("Turns     {}", turns);
    }
    if let Some(cost) = session.cost_usd {
        println!("Cost      ${}", cost.round_dp(4));
    }
    println!("Log       {}", session.log_path.display());
    if let Some(summary) = &session.summary {
        println!("Summary   {}", summary);
    }
    println!();
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

async fn run_memory_command(store: Arc<dyn Database>, cmd: MemoryCommand) -> anyhow::Result<()> {
    let service = MemoryService::new(store);
    match cmd {
        MemoryCommand::Add {
            category,
            service: scope,
            confidence,
            observation,
        } => {
            let memory = service
                .create(scope.as_deref(), category, &observation, confidence)
                .await?;
            println!("Added memory {}", memory.id);
        }
        MemoryCommand::Update {
            id,
            observation,
            category,
            service: scope,
            confidence,
            activate,
            deactivate,
        } => {
            let active = match (activate, deactivate) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let edit = MemoryEdit {
                observation,
                category,
                service: scope.map(Some),
                confidence,
                active,
            };
            let memory = service.update(id, edit).await?;
            println!(
                "Updated memory {} (confidence {:.2}, {})",
                memory.id,
                memory.confidence,
                if memory.active { "active" } else { "inactive" }
            );
        }
        MemoryCommand::Delete { id } => {
            if service.delete(id).await? {
                println!("Deleted memory {}", id);
            } else {
                anyhow::bail!("memory {} not found", id);
            }
        }
    }
    Ok(())
}
