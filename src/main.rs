//! # groundwork CLI (`gw`)
//!
//! ## Usage
//!
//! ```bash
//! gw --config ./config/gw.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gw init` | Create the SQLite database and run schema migrations |
//! | `gw index <tenant>` | Run an indexing job to completion (`--reset` wipes first) |
//! | `gw status [tenant]` | Show indexing status |
//! | `gw cancel <tenant>` | Stop the tenant's running indexing job |
//! | `gw search <tenant> "<query>"` | Show hybrid retrieval results |
//! | `gw ask <tenant> "<question>"` | Answer a question, printing the structured answer as JSON |
//! | `gw serve` | Start the HTTP server (and the scheduler, if enabled) |
//! | `gw completions <shell>` | Print shell completions |

use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use groundwork::assistant::QueryOutcome;
use groundwork::config::{self, Config};
use groundwork::indexer::{CancelOutcome, RebuildMode};
use groundwork::services::Services;
use groundwork::{logging, migrate, server};
use groundwork_core::embedding::embed_query;
use groundwork_core::models::IndexingStatus;
use groundwork_core::search::{retrieve, RetrievalMode, RetrieveRequest};

/// groundwork: grounded question answering over per-tenant document folders.
#[derive(Parser)]
#[command(name = "gw", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gw.toml")]
    config: PathBuf,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Index one tenant (or every tenant) and wait for the job to finish.
    ///
    /// Goes through the same lease as server-triggered rebuilds, so it is
    /// rejected while another job for the tenant is running.
    Index {
        /// Tenant id. Omit with `--all`.
        tenant: Option<String>,

        /// Index every configured tenant.
        #[arg(long, conflicts_with = "tenant")]
        all: bool,

        /// Remove the tenant's index before rebuilding.
        #[arg(long)]
        reset: bool,
    },

    /// Show indexing status for one tenant, or all tenants.
    Status {
        tenant: Option<String>,
    },

    /// Stop the tenant's running indexing job, in this or another process.
    Cancel {
        tenant: String,
    },

    /// Show hybrid retrieval results for a query.
    Search {
        tenant: String,
        query: String,

        /// Use enumeration mode (larger result set, looser cutoff).
        #[arg(long)]
        enumerate: bool,

        /// Override `retrieval.top_k`.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a question and print the structured answer as JSON.
    Ask {
        tenant: String,
        question: String,
    },

    /// Start the HTTP server.
    Serve,

    /// Print shell completions.
    Completions {
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "gw", &mut io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index { tenant, all, reset } => {
            let tenants = selected_tenants(&cfg, tenant, all)?;
            run_index(&cfg, &tenants, reset).await?;
        }
        Commands::Status { tenant } => {
            let tenants = selected_tenants(&cfg, tenant.clone(), tenant.is_none())?;
            let services = Services::build(&cfg).await?;
            for t in &tenants {
                print_status(&services.indexer.get_status(t).await?);
            }
        }
        Commands::Cancel { tenant } => {
            require_tenant(&cfg, &tenant)?;
            let services = Services::build(&cfg).await?;
            match services.indexer.cancel(&tenant).await? {
                CancelOutcome::Cancelled => println!("{}: indexing cancelled", tenant),
                CancelOutcome::NotRunning => bail!("{}: no indexing job is running", tenant),
                CancelOutcome::UnknownTenant => bail!("Unknown tenant: '{}'", tenant),
            }
        }
        Commands::Search {
            tenant,
            query,
            enumerate,
            limit,
        } => {
            run_search(&cfg, &tenant, &query, enumerate, limit).await?;
        }
        Commands::Ask { tenant, question } => {
            require_tenant(&cfg, &tenant)?;
            let services = Services::build(&cfg).await?;
            match services.assistant.answer_question(&tenant, &question).await? {
                QueryOutcome::Answered(answer) => {
                    println!("{}", serde_json::to_string_pretty(&answer)?);
                }
                QueryOutcome::NotReady {
                    status,
                    progress,
                    message,
                } => {
                    bail!(
                        "tenant '{}' is not ready ({} {}%): {}",
                        tenant,
                        status,
                        progress,
                        message
                    );
                }
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Completions { .. } => unreachable!("handled before config loading"),
    }

    Ok(())
}

fn require_tenant(cfg: &Config, tenant: &str) -> anyhow::Result<()> {
    if cfg.tenant(tenant).is_none() {
        bail!("Unknown tenant: '{}'. Add it under [[tenants]] in the config.", tenant);
    }
    Ok(())
}

fn selected_tenants(cfg: &Config, tenant: Option<String>, all: bool) -> anyhow::Result<Vec<String>> {
    match tenant {
        Some(t) => {
            require_tenant(cfg, &t)?;
            Ok(vec![t])
        }
        None if all => Ok(cfg.tenants.iter().map(|t| t.id.clone()).collect()),
        None => bail!("Specify a tenant id or --all"),
    }
}

async fn run_index(cfg: &Config, tenants: &[String], reset: bool) -> anyhow::Result<()> {
    let services = Services::build(cfg).await?;
    let mode = if reset {
        RebuildMode::Reset
    } else {
        RebuildMode::Incremental
    };

    let mut failed = 0;
    for tenant in tenants {
        let selector = services
            .indexer
            .default_selector(tenant)
            .with_context(|| format!("tenant '{}' is not registered", tenant))?;
        match services.indexer.rebuild(tenant, &selector, mode).await? {
            Ok(status) => {
                if !status.is_ready() {
                    failed += 1;
                }
                print_status(&status);
            }
            Err(reason) => {
                failed += 1;
                eprintln!("{}: rebuild rejected ({:?})", tenant, reason);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} tenants did not finish READY", failed, tenants.len());
    }
    Ok(())
}

async fn run_search(
    cfg: &Config,
    tenant: &str,
    query: &str,
    enumerate: bool,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    require_tenant(cfg, tenant)?;
    let services = Services::build(cfg).await?;

    let query_vec = if services.embedder.dims() > 0 {
        Some(
            embed_query(services.embedder.as_ref(), query)
                .await
                .context("failed to embed query")?,
        )
    } else {
        None
    };
    let params = cfg.retrieval.params();
    let request = RetrieveRequest {
        tenant_id: tenant,
        query,
        query_vec: query_vec.as_deref(),
        top_k: limit.unwrap_or(cfg.retrieval.top_k),
        mode: if enumerate {
            RetrievalMode::Enumeration
        } else {
            RetrievalMode::Default
        },
        params: &params,
    };
    let results = retrieve(services.store.as_ref(), &request).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for c in &results {
        println!(
            "{}. [{:.2}] {} (page {})",
            c.rank, c.fused_score, c.source_document_name, c.page_number
        );
        println!("    key: {}", c.chunk_key);
        println!("    vector: {:.3}  lexical: {:.3}", c.vector_score, c.lexical_score);
        println!("    > {}", snippet(&c.text, 160));
        println!();
    }
    Ok(())
}

fn print_status(status: &IndexingStatus) {
    println!(
        "{}: {} {}% ({} documents) {}",
        status.tenant_id, status.state, status.progress, status.document_count, status.message
    );
    if let Some(detail) = &status.error_detail {
        println!("    {}", detail);
    }
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut)
}
