//! dispatchd CLI: run the dispatcher, feed it events and signals, inspect
//! the ledger.

use chrono::Utc;
use clap::{Parser, Subcommand};
use dispatchd::autoscale::AutoscaleAdvisor;
use dispatchd::ceiling::ConcurrencyCeiling;
use dispatchd::config::Config;
use dispatchd::config::secrets::ExposeSecret;
use dispatchd::db::Db;
use dispatchd::db::inbox::InboxConfig;
use dispatchd::db::ledger::PgLedger;
use dispatchd::db::pgmq::INBOX_QUEUE;
use dispatchd::engine::{ControlPlane, Dispatcher};
use dispatchd::gate::{AccountPolicy, AssertionVerifier, PolicyGate};
use dispatchd::launcher::{ProcessBackend, TaskLauncher};
use dispatchd::ledger::DispatchLedger;
use dispatchd::ledger::memory::MemoryLedger;
use dispatchd::model::{
    DispatchRecord, EventId, InboundMessage, InterruptionSignal, RawEvent, State, TaskHandle,
    UtilizationSample, WireEvent,
};
use dispatchd::telemetry::{TelemetryConfig, init_telemetry};
use dispatchd::templates::TemplateRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dispatchd", about = "Cross-account, event-triggered task dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher daemon
    Serve {
        /// Directory containing task template TOML files
        #[arg(long)]
        templates: Option<PathBuf>,
        /// Cross-account policy file
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Read inbound messages as JSON lines from stdin into an in-memory
        /// ledger instead of using Postgres
        #[arg(long)]
        stdin: bool,
    },
    /// Enqueue a storage event on the inbox
    Ingest {
        /// Account the event originates from
        #[arg(long)]
        account: String,
        /// Resource identifier, `bucket/key`
        resource: String,
        /// Event type, e.g. ObjectCreated:Put
        #[arg(long, default_value = "ObjectCreated:Put")]
        event_type: String,
        /// Per-object sequence token
        #[arg(long)]
        sequence: String,
        /// Account the transport claims; defaults to --account
        #[arg(long)]
        declared_account: Option<String>,
        /// Attach an identity assertion signed with GATE_SIGNING_KEY
        #[arg(long)]
        sign: bool,
    },
    /// Enqueue a control signal on the inbox
    Signal {
        #[command(subcommand)]
        action: SignalAction,
    },
    /// Dispatch record operations
    Records {
        #[command(subcommand)]
        action: RecordsAction,
    },
}

#[derive(Subcommand)]
enum SignalAction {
    /// Capacity behind a task is being reclaimed
    Interrupt {
        handle: String,
        #[arg(long, default_value = "capacity reclaimed")]
        reason: String,
    },
    /// Report host utilization
    Utilization {
        #[arg(long)]
        cpu: f64,
        #[arg(long)]
        mem: f64,
    },
    /// Abort a running task (re-queued within budget)
    Cancel {
        /// Full event id
        event_id: String,
        #[arg(long, default_value = "operator abort")]
        reason: String,
    },
    /// Report a task's completion
    Complete {
        handle: String,
        /// The task failed
        #[arg(long)]
        failed: bool,
        #[arg(long)]
        detail: Option<String>,
    },
}

#[derive(Subcommand)]
enum RecordsAction {
    /// List dispatch records, oldest first
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a dispatch record
    Show {
        /// Event id (full or prefix)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve {
            templates,
            policy,
            stdin,
        } => cmd_serve(config, templates, policy, stdin).await,
        Command::Ingest {
            account,
            resource,
            event_type,
            sequence,
            declared_account,
            sign,
        } => {
            let wire = WireEvent {
                source_account: Some(account.clone()),
                resource_id: Some(resource),
                event_type: Some(event_type),
                sequence_token: Some(sequence),
                timestamp: Some(Utc::now()),
                assertion: None,
            };
            let wire = if sign { sign_event(&config, wire)? } else { wire };
            let message = InboundMessage::Event {
                declared_account: declared_account.unwrap_or(account),
                event: wire,
            };
            let db = connect(&config).await?;
            let msg_id = db.push_inbox(&message).await?;
            println!("Enqueued: message {msg_id}");
            Ok(())
        }
        Command::Signal { action } => {
            let message = match action {
                SignalAction::Interrupt { handle, reason } => {
                    InboundMessage::Interruption(InterruptionSignal {
                        task_handle: TaskHandle(handle),
                        reason,
                    })
                }
                SignalAction::Utilization { cpu, mem } => {
                    InboundMessage::Utilization(UtilizationSample {
                        cpu_pct: cpu,
                        mem_pct: mem,
                    })
                }
                SignalAction::Cancel { event_id, reason } => InboundMessage::Cancel {
                    event_id: event_id.parse()?,
                    reason,
                },
                SignalAction::Complete {
                    handle,
                    failed,
                    detail,
                } => InboundMessage::Completion {
                    task_handle: TaskHandle(handle),
                    success: !failed,
                    detail,
                },
            };
            let db = connect(&config).await?;
            let msg_id = db.push_inbox(&message).await?;
            println!("Enqueued: message {msg_id}");
            Ok(())
        }
        Command::Records { action } => {
            let db = connect(&config).await?;
            let ledger = PgLedger::new(db);
            match action {
                RecordsAction::List { state, limit } => {
                    cmd_records_list(&ledger, state, limit).await
                }
                RecordsAction::Show { id } => cmd_records_show(&ledger, id).await,
            }
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let url = config.require_database_url()?;
    let db = Db::connect(url.expose_secret(), config.database_max_connections).await?;
    db.migrate().await?;
    db.create_queue(INBOX_QUEUE).await?;
    Ok(db)
}

fn sign_event(config: &Config, mut wire: WireEvent) -> anyhow::Result<WireEvent> {
    let key = config
        .gate_signing_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--sign needs GATE_SIGNING_KEY"))?;
    let raw = RawEvent::from_wire(wire.clone())?;
    wire.assertion = AssertionVerifier::new(key).sign(&raw);
    Ok(wire)
}

async fn cmd_serve(
    config: Config,
    templates: Option<PathBuf>,
    policy: Option<PathBuf>,
    stdin: bool,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "dispatchd".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let template_dir = templates.unwrap_or_else(|| config.template_dir.clone());
    let templates = TemplateRegistry::load_from_dir(&template_dir)?;
    let policy_file = policy.unwrap_or_else(|| config.policy_file.clone());
    let policy = AccountPolicy::load_from_file(&policy_file)?;
    info!(templates = templates.len(), accounts = policy.len(), "configuration loaded");
    if policy.is_empty() {
        warn!("account policy is empty, every event will be denied");
    }
    let verifier = config.gate_signing_key.clone().map(AssertionVerifier::new);
    let gate = Arc::new(PolicyGate::new(policy, verifier));

    let (inbox_tx, inbox_rx) = mpsc::channel::<InboundMessage>(256);
    let (ledger, db): (Arc<dyn DispatchLedger>, Option<Db>) = if stdin {
        (Arc::new(MemoryLedger::new()), None)
    } else {
        let db = connect(&config).await?;
        (Arc::new(PgLedger::new(db.clone())), Some(db))
    };

    let ceiling = Arc::new(ConcurrencyCeiling::new(
        config.ceiling.initial,
        config.ceiling.min,
        config.ceiling.max,
    )?);
    tokio::fs::create_dir_all(&config.task_dir).await?;
    let (backend, signals) = ProcessBackend::new(config.task_dir.clone());
    let launcher = Arc::new(TaskLauncher::new(
        Arc::new(backend),
        Arc::clone(&ledger),
        Arc::clone(&ceiling),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        gate,
        Arc::new(templates),
        Arc::clone(&ledger),
        launcher,
        config.dispatch.clone(),
        config.reclaim.clone(),
    ));
    let advisor = Arc::new(AutoscaleAdvisor::new(
        ceiling,
        Arc::clone(&ledger),
        config.autoscale.clone(),
    ));
    let control = Arc::new(ControlPlane::new(dispatcher, advisor));

    match db {
        Some(db) => {
            let shutdown = control.subscribe_shutdown();
            tokio::spawn(
                async move { db.run_inbox(InboxConfig::default(), inbox_tx, shutdown).await },
            );
        }
        None => {
            tokio::spawn(read_stdin(inbox_tx));
        }
    }

    let ctrl = Arc::clone(&control);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    control.run(inbox_rx, signals).await?;
    Ok(())
}

/// Forward JSON lines from stdin until EOF. Lines that do not parse are
/// logged and skipped.
async fn read_stdin(tx: mpsc::Sender<InboundMessage>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!("stdin read failed: {e}");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<InboundMessage>(&line) {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("skipping unparsable line: {e}"),
        }
    }
}

async fn cmd_records_list(
    ledger: &PgLedger,
    state: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let state_filter: Option<State> = match state {
        Some(s) => Some(s.parse()?),
        None => None,
    };

    let records = ledger.list(state_filter, limit).await?;
    if records.is_empty() {
        println!("No dispatch records found.");
        return Ok(());
    }

    println!(
        "{:<12}  {:<16}  {:<10}  {:<5}  {:<40}  CREATED",
        "ID", "TEMPLATE", "STATE", "TRIES", "RESOURCE"
    );
    println!("{}", "-".repeat(104));

    for record in &records {
        let resource = record.event.resource.to_string();
        let resource_display = resource.get(..40).unwrap_or(&resource);
        println!(
            "{:<12}  {:<16}  {:<10}  {:<5}  {:<40}  {}",
            record.id().short(),
            record.template,
            record.state,
            format!("{}/{}", record.attempts, record.retry_ceiling),
            resource_display,
            record.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} record(s)", records.len());
    Ok(())
}

async fn cmd_records_show(ledger: &PgLedger, id: String) -> anyhow::Result<()> {
    let record = match id.parse::<EventId>() {
        Ok(event_id) => ledger.get(&event_id).await?,
        Err(_) => find_by_prefix(ledger, &id).await?,
    };

    println!("ID:          {}", record.id().0);
    println!("Template:    {}", record.template);
    println!("State:       {}", record.state);
    println!("Attempts:    {}/{}", record.attempts, record.retry_ceiling);
    println!("Account:     {}", record.event.source_account);
    println!("Resource:    {}", record.event.resource);
    println!("Kind:        {}", record.event.kind);
    println!("Occurred:    {}", record.event.occurred_at);
    println!("Received:    {}", record.event.received_at);
    println!(
        "Handle:      {}",
        record.task_handle.as_ref().map(|h| h.0.as_str()).unwrap_or("-")
    );
    if let Some(at) = record.last_attempt_at {
        println!("Last Launch: {at}");
    }
    if let Some(ref err) = record.last_error {
        println!("Last Error:  {err}");
    }
    println!("Created:     {}", record.created_at);
    println!("Updated:     {}", record.updated_at);
    Ok(())
}

async fn find_by_prefix(ledger: &PgLedger, prefix: &str) -> anyhow::Result<DispatchRecord> {
    let prefix = prefix.to_ascii_lowercase();
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!("'{prefix}' is not an event id or id prefix");
    }
    let mut matches = ledger.find_by_id_prefix(&prefix, 2).await?;
    match matches.len() {
        0 => anyhow::bail!("no dispatch record matching prefix '{prefix}'"),
        1 => Ok(matches.remove(0)),
        _ => anyhow::bail!("several dispatch records match prefix '{prefix}', be more specific"),
    }
}
