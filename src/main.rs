use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fillgate::config::{ServiceConfig, SynthesizerKind};
use fillgate::db::{create_pool, PgRowSource, RowSource, SchemaContext};
use fillgate::digest::signing_headers;
use fillgate::handlers::HandlerRegistry;
use fillgate::synth::{
    LlmConfig, LlmSynthesizer, RuleBasedSynthesizer, SynthesisMode, SynthesisRequest, Synthesizer,
};
use fillgate::{Envelope, FillService, Limits, RequestKind, RuleTable, SafetyGate, Template};

/// Fill caller-declared JSON templates from PostgreSQL
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (default: <config_dir>/fillgate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fill one envelope read from a file or stdin
    Fill {
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Serve JSON-lines envelopes on stdin, responses on stdout
    ServeStdio,
    /// Print the statements an envelope would run, without a database
    Plan {
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Run a statement through the safety gate
    CheckSql { sql: String },
    /// Print the authentication headers for a request body
    Sign {
        /// Calling service name
        #[arg(long)]
        service: String,
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Print the schema context
    Schema {
        /// Refresh column types from the live database first
        #[arg(long)]
        introspect: bool,
        #[arg(long, default_value = "public")]
        db_schema: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Fill { input } => {
            let service = build_service(&config)?;
            let envelope = read_envelope(input.as_deref())?;
            let out = service.handle(envelope).await;
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::ServeStdio => serve_stdio(Arc::new(build_service(&config)?)).await?,
        Command::Plan { input } => plan(&config, input.as_deref())?,
        Command::CheckSql { sql } => {
            let gate = SafetyGate::for_schema(&SchemaContext::builtin());
            match gate.inspect(&sql) {
                Ok(()) => println!("safe"),
                Err(e) => {
                    println!("{}", e);
                    std::process::exit(1);
                }
            }
        }
        Command::Sign { service, input } => {
            let body = read_input(input.as_deref())?;
            println!("{}", signing_headers(&service, &body));
        }
        Command::Schema {
            introspect,
            db_schema,
        } => {
            let mut schema = SchemaContext::builtin();
            if introspect {
                let pool = create_pool(&config.database, &config.pool)?;
                let client = pool
                    .get()
                    .await
                    .with_context(|| format!("Failed to connect to {}", config.database.display_string()))?;
                let seen = schema.refresh_column_types(&client, &db_schema).await?;
                info!(columns = seen, schema = %db_schema, "refreshed column types");
            }
            print!("{}", schema.render());
        }
    }

    Ok(())
}

fn build_service(config: &ServiceConfig) -> Result<FillService> {
    let schema = SchemaContext::builtin();
    let rules = load_rules(config, &schema)?;
    let pool = create_pool(&config.database, &config.pool)?;
    let rows: Arc<dyn RowSource> = Arc::new(PgRowSource::new(pool));
    info!(
        database = %config.database.display_string(),
        pool_size = config.pool.max_size,
        page_size = config.limits.page_size,
        "service ready"
    );
    Ok(FillService::new(
        rows,
        synthesizer(config),
        Arc::new(schema),
        Arc::new(rules),
        Arc::new(HandlerRegistry::builtin()),
        Limits::from(&config.limits),
    ))
}

fn synthesizer(config: &ServiceConfig) -> Arc<dyn Synthesizer> {
    match config.synthesizer.kind {
        SynthesizerKind::Rules => Arc::new(RuleBasedSynthesizer::new()),
        SynthesizerKind::Llm => match LlmConfig::from_settings(&config.synthesizer) {
            Some(llm) => {
                info!(provider = ?llm.provider, model = %llm.model, "using generation service");
                Arc::new(LlmSynthesizer::new(llm))
            }
            None => {
                warn!(
                    env = %config.synthesizer.api_key_env,
                    "API key not set, falling back to rule-based synthesis"
                );
                Arc::new(RuleBasedSynthesizer::new())
            }
        },
    }
}

fn load_rules(config: &ServiceConfig, schema: &SchemaContext) -> Result<RuleTable> {
    let rules = RuleTable::load(config.rules_path.as_deref())?;
    for problem in rules.problems(schema) {
        warn!(%problem, "rule table");
    }
    Ok(rules)
}

fn read_input(input: Option<&Path>) -> Result<Vec<u8>> {
    match input {
        Some(path) => std::fs::read(path).with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}

fn read_envelope(input: Option<&Path>) -> Result<Envelope> {
    let body = read_input(input)?;
    serde_json::from_slice(&body).context("Failed to parse envelope")
}

/// One task per line; a single writer keeps response lines whole.
async fn serve_stdio(service: Arc<FillService>) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    info!("serving envelopes on stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "discarding malformed envelope");
                continue;
            }
        };
        let service = service.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let out = service.handle(envelope).await;
            match serde_json::to_string(&out) {
                Ok(line) => {
                    if tx.send(line).await.is_err() {
                        error!("response writer closed");
                    }
                }
                Err(e) => error!(error = %e, "failed to serialize response"),
            }
        });
    }

    drop(tx);
    writer.await??;
    Ok(())
}

fn plan(config: &ServiceConfig, input: Option<&Path>) -> Result<()> {
    let schema = SchemaContext::builtin();
    let rules = load_rules(config, &schema)?;
    let gate = SafetyGate::for_schema(&schema);
    let envelope = read_envelope(input)?;
    let template = Template::from_value(&envelope.response);
    let kind = RequestKind::classify(&envelope.payload);
    let page_size = config.limits.page_size;

    if let Some(mode) = kind.handler_mode() {
        if let Some(handler) = HandlerRegistry::builtin().resolve(&envelope.requester_service, mode) {
            let fixed = handler.build(mode, &envelope.payload, page_size)?;
            println!("-- fixed plan `{}`", handler.name());
            print_statement("data", &gate, &fixed.data.sql, &fixed.data.params);
            if let Some(count) = &fixed.count {
                print_statement("count", &gate, &count.sql, &count.params);
            }
            return Ok(());
        }
    }

    let modes = match &kind {
        RequestKind::Batch { cursor } => vec![
            SynthesisMode::Batch {
                cursor: cursor.clone(),
                page_size,
            },
            SynthesisMode::Count,
        ],
        _ => vec![SynthesisMode::Point],
    };
    let synthesizer = RuleBasedSynthesizer::new();
    for mode in modes {
        let request = SynthesisRequest {
            mode: mode.clone(),
            requester: &envelope.requester_service,
            payload: &envelope.payload,
            template: &template,
            schema: &schema,
            rules: &rules,
            max_rows: page_size,
        };
        match synthesizer.plan(&request) {
            Ok(plan) => print_statement(mode.label(), &gate, &plan.sql, &plan.param_order),
            Err(e) => println!("-- {}: {}\n", mode.label(), e),
        }
    }
    Ok(())
}

fn print_statement<P: std::fmt::Debug>(label: &str, gate: &SafetyGate, sql: &str, params: &[P]) {
    let verdict = match gate.inspect(sql) {
        Ok(()) => "safe".to_string(),
        Err(e) => e.to_string(),
    };
    println!("-- {} ({})\n{}\n-- params: {:?}\n", label, verdict, sql, params);
}
