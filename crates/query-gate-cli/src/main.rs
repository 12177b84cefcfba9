use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use query_gate_chat::{backend_for, select_backend, ChatService};
use query_gate_config::{load_settings_from_path, AgentBackendKind, Settings};
use query_gate_db::{accessible_schema, describe_schema, migrate_application_schema, Database};
use query_gate_domain::{AuditSink, ThreadId, TracingAuditSink};
use query_gate_policy::{classify_statement, first_write_keyword};
use query_gate_store_core::ChatStore;
use query_gate_store_sqlite::SqliteChatStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "query-gate")]
#[command(about = "Read-only AI chat over an application database")]
struct Cli {
    /// Settings YAML. Defaults plus `QUERY_GATE_*` overrides when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Migrate,
    Thread(ThreadArgs),
    Ask(AskArgs),
    Stream(TurnArgs),
    Schema,
    Classify { sql: String },
    Bench(BenchArgs),
}

#[derive(Debug, Args)]
struct ThreadArgs {
    #[command(subcommand)]
    command: ThreadSubcommand,
}

#[derive(Debug, Subcommand)]
enum ThreadSubcommand {
    New {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        title: Option<String>,
    },
}

#[derive(Debug, Args)]
struct TurnArgs {
    #[arg(long)]
    thread: String,
    #[arg(long)]
    question: String,
}

#[derive(Debug, Args)]
struct AskArgs {
    #[command(flatten)]
    turn: TurnArgs,
    #[arg(long)]
    save_log: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct BenchArgs {
    #[command(flatten)]
    turn: TurnArgs,
    #[arg(long, default_value_t = 5)]
    iterations: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let settings = load_settings(cli.config.as_ref())?;

    match cli.command {
        Commands::Migrate => migrate_command(&settings),
        Commands::Thread(args) => thread_command(&settings, args),
        Commands::Ask(args) => ask_command(&settings, &args),
        Commands::Stream(args) => stream_command(&settings, &args),
        Commands::Schema => schema_command(&settings),
        Commands::Classify { sql } => {
            classify_command(&sql);
            Ok(())
        }
        Commands::Bench(args) => bench_command(&settings, &args),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    if let Some(path) = path {
        return load_settings_from_path(path);
    }
    let mut settings = Settings::default();
    settings.apply_env_overrides(|key| std::env::var(key).ok())?;
    settings.validate()?;
    Ok(settings)
}

fn open_store(settings: &Settings) -> Result<SqliteChatStore> {
    let store = SqliteChatStore::open(&settings.chat_store.path)?;
    store.migrate()?;
    Ok(store)
}

fn audit_sink() -> Rc<dyn AuditSink> {
    Rc::new(TracingAuditSink)
}

fn migrate_command(settings: &Settings) -> Result<()> {
    let db = Database::open(&settings.database)?;
    migrate_application_schema(&db)?;
    open_store(settings)?;
    println!(
        "migrated database={} chat_store={}",
        settings.database.path.display(),
        settings.chat_store.path.display()
    );
    Ok(())
}

fn thread_command(settings: &Settings, args: ThreadArgs) -> Result<()> {
    match args.command {
        ThreadSubcommand::New { user_id, title } => {
            let store = open_store(settings)?;
            let thread = store.create_thread(&user_id, title.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&thread)?);
            Ok(())
        }
    }
}

fn ask_command(settings: &Settings, args: &AskArgs) -> Result<()> {
    let thread_id = ThreadId::from_str(&args.turn.thread)?;
    let store = open_store(settings)?;
    let backend = select_backend(settings);
    let service = ChatService::new(settings, &store, backend.as_ref(), audit_sink());

    let message = service.ask(thread_id, &args.turn.question)?;
    if let Some(path) = &args.save_log {
        service.save_query_log(path)?;
        eprintln!("query log written to {}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&message)?);
    Ok(())
}

fn stream_command(settings: &Settings, args: &TurnArgs) -> Result<()> {
    let thread_id = ThreadId::from_str(&args.thread)?;
    let store = open_store(settings)?;
    let backend = select_backend(settings);
    let service = ChatService::new(settings, &store, backend.as_ref(), audit_sink());

    let mut stdout = std::io::stdout().lock();
    for chunk in service.ask_stream(thread_id, &args.question)? {
        stdout.write_all(chunk?.as_bytes())?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

fn schema_command(settings: &Settings) -> Result<()> {
    let db = Database::open(&settings.database)?;
    let columns = accessible_schema(&db)
        .context("failed to read the accessible schema; run `query-gate migrate` first")?;
    print!("{}", describe_schema(&columns));
    Ok(())
}

fn classify_command(sql: &str) {
    if classify_statement(sql).is_write() {
        let keyword = first_write_keyword(sql).unwrap_or_default();
        println!("verdict=write keyword={keyword}");
    } else {
        println!("verdict=read");
    }
}

fn bench_command(settings: &Settings, args: &BenchArgs) -> Result<()> {
    let thread_id = ThreadId::from_str(&args.turn.thread)?;
    let iterations = args.iterations.max(1);
    let store = open_store(settings)?;

    let mut averages = Vec::new();
    for kind in [AgentBackendKind::HttpJson, AgentBackendKind::Mock] {
        let backend = backend_for(kind, settings);
        let service = ChatService::new(settings, &store, backend.as_ref(), audit_sink());

        let mut total = Duration::ZERO;
        let mut failures = 0_u32;
        for _ in 0..iterations {
            let started = Instant::now();
            let outcome = service.ask(thread_id, &args.turn.question);
            total += started.elapsed();
            match outcome {
                Ok(message) if message.metadata_flag("error") => failures += 1,
                Ok(_) => {}
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        backend = kind.as_str(),
                        error = %format!("{err:#}"),
                        "bench turn failed"
                    );
                }
            }
        }

        let average_ms = total.as_secs_f64() * 1_000.0 / f64::from(iterations);
        println!(
            "backend={} iterations={iterations} failures={failures} avg_ms={average_ms:.2}",
            kind.as_str()
        );
        averages.push(average_ms);
    }

    if let &[baseline, candidate] = averages.as_slice() {
        match percentage_difference(baseline, candidate) {
            Some(pct) => println!("difference_pct={pct:.2}"),
            None => println!("difference_pct=n/a"),
        }
    }
    Ok(())
}

/// Relative change of `candidate` against `baseline`, in percent.
fn percentage_difference(baseline: f64, candidate: f64) -> Option<f64> {
    if baseline <= 0.0 {
        return None;
    }
    Some((candidate - baseline) / baseline * 100.0)
}
