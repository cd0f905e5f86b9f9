use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, warn};

use kb::actions::queue::{apply_event, count_views, get_item, list_items, QueueFilter};
use kb::actions::refine::{Refiner, Verdict};
use kb::actions::{ActionEvent, ActionKey, View};
use kb::analysis::llm::{AnthropicClient, LlmBackend};
use kb::analysis::{AnalysisCatalog, Analyzer};
use kb::config;
use kb::ingest::{self, ImportOptions};
use kb::kb::Kb;
use kb::output::{json as json_out, table};
use kb::registry::Decimal;
use kb::search::filters::Filters;
use kb::server::{self, AppState};
use kb::transcribe::{self, CommandTranscriber, TranscribeOptions};

#[derive(Parser)]
#[command(
    name = "kb",
    version,
    about = "Knowledge Base: transcribe recordings, run LLM analyses, review and post derived content"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// KB root directory (default: ~/.kb)
    #[arg(long, global = true, env = "KB_ROOT")]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Transcribe audio/video files, directories or globs
    Transcribe {
        /// Media files, directories or glob patterns
        #[arg(required = true)]
        paths: Vec<String>,

        /// Decimal category for the new transcripts (e.g. 50.01.01)
        #[arg(long)]
        decimal: Option<String>,

        /// Tags to attach (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Recognizer model (default from config)
        #[arg(long)]
        model: Option<String>,

        /// Label speakers (needs a HuggingFace token)
        #[arg(long)]
        diarize: bool,

        /// HuggingFace token (or HF_TOKEN)
        #[arg(long)]
        hf_token: Option<String>,

        /// Re-transcribe sources that already have a transcript
        #[arg(long)]
        force: bool,

        /// Run the default analyses afterwards
        #[arg(long)]
        analyze: bool,

        /// Anthropic API key for --analyze
        #[arg(long)]
        api_key: Option<String>,

        /// Preview without transcribing
        #[arg(long)]
        dry_run: bool,
    },

    /// Import existing text/markdown transcripts
    Import {
        /// File or directory paths to import
        paths: Vec<String>,

        /// Read from stdin
        #[arg(long)]
        stdin: bool,

        /// Decimal category
        #[arg(long)]
        decimal: Option<String>,

        /// Tags to attach (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Force format: markdown, text
        #[arg(long)]
        format: Option<String>,

        /// Preview without importing
        #[arg(long)]
        dry_run: bool,
    },

    /// Run LLM analyses over transcripts
    Analyze {
        /// Transcript IDs
        ids: Vec<String>,

        /// Analysis types to run (repeatable; default: the decimal's defaults)
        #[arg(long = "type", short = 't')]
        types: Vec<String>,

        /// Analyze every transcript
        #[arg(long)]
        all: bool,

        /// With --all, only transcripts under this decimal
        #[arg(long)]
        decimal: Option<String>,

        /// Recompute requested analyses that already exist
        #[arg(long)]
        force: bool,

        /// Anthropic API key (or ANTHROPIC_API_KEY)
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Review and move derived content through its lifecycle
    Actions {
        #[command(subcommand)]
        command: ActionsCommand,
    },

    /// Manage decimal categories and tags
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },

    /// List analysis types, or show one prompt
    Prompts {
        /// Analysis type name
        name: Option<String>,
    },

    /// Flag and resolve problems with analysis prompts
    Feedback {
        #[command(subcommand)]
        command: FeedbackCommand,
    },

    /// Search transcripts using full-text search
    Search {
        /// Search query (FTS5 syntax: phrases, boolean, prefix*)
        query: String,

        /// Filter by decimal prefix
        #[arg(long)]
        decimal: Option<String>,

        /// Filter by tag
        #[arg(long)]
        tag: Option<String>,

        /// Filter by date range start (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,

        /// Filter by date range end (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,

        /// Maximum results to return
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// List transcripts
    List {
        /// Filter by decimal prefix
        #[arg(long)]
        decimal: Option<String>,

        /// Filter by tag
        #[arg(long)]
        tag: Option<String>,

        /// Filter by source kind (audio, video, text, markdown, daemon)
        #[arg(long)]
        source: Option<String>,

        /// Filter by date range start
        #[arg(long)]
        from: Option<String>,

        /// Filter by date range end
        #[arg(long)]
        to: Option<String>,

        /// Sort by: date (default), title or decimal
        #[arg(long, default_value = "date")]
        sort: String,

        /// Maximum results
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Show transcript details
    Show {
        /// Transcript ID
        id: String,

        /// Print segments
        #[arg(long)]
        segments: bool,

        /// With --segments, only this speaker
        #[arg(long)]
        speaker: Option<String>,

        /// Print the full text
        #[arg(long)]
        text: bool,
    },

    /// Delete a transcript and its action state
    Delete {
        /// Transcript ID
        id: String,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Manage the search index
    Index {
        #[command(subcommand)]
        command: IndexCommand,
    },

    /// Show KB statistics
    Stats,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Run the review dashboard
    Serve {
        /// Bind address (default from config)
        #[arg(long)]
        host: Option<String>,

        /// Port (default from config)
        #[arg(long)]
        port: Option<u16>,

        /// Anthropic API key for judge/iterate
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Control the dictation daemon
    #[cfg(unix)]
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Subcommand)]
enum ActionsCommand {
    /// List items in a view
    List {
        /// queue, review, posting or archive
        #[arg(long)]
        view: Option<String>,

        /// Filter by decimal prefix
        #[arg(long)]
        decimal: Option<String>,

        /// Filter by analysis type
        #[arg(long = "type")]
        analysis_type: Option<String>,
    },
    /// Show one item
    Show { id: String },
    /// Approve a new item (simple → done, auto-judge → staged)
    Approve { id: String },
    /// Mark a staged draft ready to post
    Ready { id: String },
    /// Record that the content was posted
    Posted { id: String },
    /// Mark an item done without posting
    Done { id: String },
    /// Skip an item
    Skip { id: String },
    /// Move a done or skipped item back to the queue
    Reopen { id: String },
    /// Regenerate a draft with feedback
    Iterate {
        id: String,

        /// Reviewer feedback for the next draft
        #[arg(long, short = 'f')]
        feedback: Option<String>,

        #[arg(long)]
        api_key: Option<String>,
    },
    /// Score the current draft with its judge
    Judge {
        id: String,

        #[arg(long)]
        api_key: Option<String>,
    },
    /// Judge and iterate until the draft passes or rounds run out
    Refine {
        id: String,

        #[arg(long)]
        api_key: Option<String>,
    },
}

#[derive(Subcommand)]
enum RegistryCommand {
    /// List decimals and tags
    List,
    /// Add or replace a decimal
    Add {
        /// Code such as 50.01.01
        code: String,
        name: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Default analyses (comma separated)
        #[arg(long, value_delimiter = ',')]
        analyses: Vec<String>,
    },
    /// Remove a decimal
    Remove { code: String },
    /// Set a decimal's default analyses
    SetAnalyses {
        code: String,

        /// Analysis type names; none clears the list
        analyses: Vec<String>,
    },
    /// Add or replace a tag
    TagAdd {
        name: String,

        #[arg(long, default_value = "")]
        description: String,
    },
    /// Remove a tag
    TagRemove { name: String },
}

#[derive(Subcommand)]
enum FeedbackCommand {
    /// List flags
    List {
        /// Only this analysis type
        #[arg(long = "type")]
        analysis_type: Option<String>,

        /// Include resolved flags
        #[arg(long)]
        all: bool,
    },
    /// Flag an analysis output
    Flag {
        transcript_id: String,
        analysis_type: String,
        reason: String,
    },
    /// Resolve a flag
    Resolve { id: String },
}

#[derive(Subcommand)]
enum IndexCommand {
    /// Rebuild the index from the transcript documents
    Rebuild,
    /// Show index info
    Info,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Create the default config file
    Init,
    /// Show config with secrets redacted
    Show,
}

#[cfg(unix)]
#[derive(Subcommand)]
enum DaemonCommand {
    /// Run in the foreground
    Run,
    /// Start in the background
    Start,
    /// Stop a running daemon
    Stop,
    /// Show daemon state
    Status,
    /// Start or stop recording
    Toggle,
    /// Abandon the current recording
    Cancel,
}

fn init_logging(default: tracing::Level) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default.into()),
        )
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_output = cli.json;

    let root = match cli.root {
        Some(root) => root,
        None => config::default_root()?,
    };

    #[cfg(unix)]
    let _log_guard = match &cli.command {
        Commands::Daemon {
            command: DaemonCommand::Run,
        } => {
            let log_dir = kb::store::KbPaths::new(&root).log_dir();
            std::fs::create_dir_all(&log_dir)?;
            Some(kb::daemon::init_file_logging(&log_dir))
        }
        Commands::Serve { .. } => {
            init_logging(tracing::Level::INFO);
            None
        }
        _ => {
            init_logging(tracing::Level::WARN);
            None
        }
    };
    #[cfg(not(unix))]
    init_logging(match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    });

    let kb = Kb::open(&root)?;

    match cli.command {
        Commands::Transcribe {
            paths,
            decimal,
            tags,
            model,
            diarize,
            hf_token,
            force,
            analyze,
            api_key,
            dry_run,
        } => {
            let transcriber = CommandTranscriber::from_config(&kb.config.transcription)?;
            let opts = TranscribeOptions {
                decimal,
                tags,
                model,
                diarize,
                hf_token,
                force,
                dry_run,
            };
            let ids = transcribe::transcribe_paths(&kb, &transcriber, &paths, &opts)?;

            if json_output {
                json_out::print_json(&serde_json::json!({ "transcribed": ids }))?;
            } else if !dry_run {
                println!("Transcribed {} file{}", ids.len(), plural(ids.len()));
                for id in &ids {
                    println!("  {id}");
                }
            }

            if analyze && !ids.is_empty() {
                let llm = AnthropicClient::from_config(&kb.config.llm, api_key.as_deref())?;
                run_analyses(&kb, &llm, &ids, &[], false, json_output)?;
            }
        }

        Commands::Import {
            paths,
            stdin,
            decimal,
            tags,
            format,
            dry_run,
        } => {
            let format_enum = format
                .as_deref()
                .map(|f| {
                    ingest::Format::from_str(f)
                        .with_context(|| format!("Unknown format: {f}. Use: markdown, text"))
                })
                .transpose()?;
            let opts = ImportOptions {
                decimal,
                tags,
                format: format_enum,
                dry_run,
            };

            let ids: Vec<String> = if stdin {
                ingest::import_stdin(&kb, &opts)?.into_iter().collect()
            } else if paths.is_empty() {
                bail!("No paths provided. Use --stdin to read from stdin.");
            } else {
                ingest::import_paths(&kb, &paths, &opts)?
            };

            if json_output {
                json_out::print_json(&serde_json::json!({ "imported": ids }))?;
            } else if !dry_run {
                println!("Imported {} transcript{}", ids.len(), plural(ids.len()));
            }
        }

        Commands::Analyze {
            ids,
            types,
            all,
            decimal,
            force,
            api_key,
        } => {
            let ids = if all {
                let prefix = decimal.as_deref();
                kb.store
                    .list()?
                    .into_iter()
                    .filter(|t| match (prefix, t.decimal.as_deref()) {
                        (None, _) => true,
                        (Some(p), Some(d)) => d == p || d.starts_with(&format!("{p}.")),
                        (Some(_), None) => false,
                    })
                    .map(|t| t.id)
                    .collect()
            } else if ids.is_empty() {
                bail!("Give transcript IDs or --all");
            } else {
                ids
            };
            let llm = AnthropicClient::from_config(&kb.config.llm, api_key.as_deref())?;
            run_analyses(&kb, &llm, &ids, &types, force, json_output)?;
        }

        Commands::Actions { command } => run_actions(&kb, command, json_output)?,

        Commands::Registry { command } => run_registry(&kb, command, json_output)?,

        Commands::Prompts { name } => {
            let catalog = kb.catalog()?;
            let feedback = kb.feedback()?;
            match name {
                Some(name) => {
                    let ty = catalog.require(&name)?;
                    if json_output {
                        json_out::print_json(ty)?;
                    } else {
                        println!("{} ({})", ty.label, ty.name);
                        if !ty.requires.is_empty() {
                            println!("  requires: {}", ty.requires.join(", "));
                        }
                        if let Some(judge) = &ty.judge {
                            println!("  judge:    {judge} (threshold {})", ty.threshold);
                        }
                        println!("\n{}", ty.template);
                        let flags = feedback.list(Some(name.as_str()), false);
                        if !flags.is_empty() {
                            println!("\nOpen feedback:");
                            table::print_flags(&flags);
                        }
                    }
                }
                None => {
                    if json_output {
                        json_out::print_json(&catalog.iter().collect::<Vec<_>>())?;
                    } else {
                        table::print_prompts(&catalog, &feedback.open_counts());
                    }
                }
            }
        }

        Commands::Feedback { command } => {
            let path = kb.paths.feedback_file();
            let mut log = kb.feedback()?;
            match command {
                FeedbackCommand::List { analysis_type, all } => {
                    let flags = log.list(analysis_type.as_deref(), all);
                    if json_output {
                        json_out::print_json(&flags)?;
                    } else {
                        table::print_flags(&flags);
                    }
                }
                FeedbackCommand::Flag {
                    transcript_id,
                    analysis_type,
                    reason,
                } => {
                    kb.store.require(&transcript_id)?;
                    kb.catalog()?.require(&analysis_type)?;
                    let flag = log.flag(&transcript_id, &analysis_type, &reason)?;
                    log.save(&path)?;
                    if json_output {
                        json_out::print_json(&flag)?;
                    } else {
                        println!("Flagged {analysis_type} ({})", flag.id);
                    }
                }
                FeedbackCommand::Resolve { id } => {
                    let flag = log.resolve(&id)?.clone();
                    log.save(&path)?;
                    if json_output {
                        json_out::print_json(&flag)?;
                    } else {
                        println!("Resolved {}", flag.id);
                    }
                }
            }
        }

        Commands::Search {
            query,
            decimal,
            tag,
            from,
            to,
            limit,
        } => {
            let filters = Filters {
                decimal,
                tag,
                source_kind: None,
                from_date: from,
                to_date: to,
            };
            let results = kb.index()?.search(&query, &filters, limit)?;
            if json_output {
                json_out::print_json(&serde_json::json!({
                    "query": query,
                    "total": results.len(),
                    "transcripts": results,
                }))?;
            } else {
                table::print_search_results(&results, &query);
            }
        }

        Commands::List {
            decimal,
            tag,
            source,
            from,
            to,
            sort,
            limit,
        } => {
            let filters = Filters {
                decimal,
                tag,
                source_kind: source,
                from_date: from,
                to_date: to,
            };
            let results = kb.index()?.list(&filters, &sort, limit)?;
            if json_output {
                json_out::print_json(&results)?;
            } else {
                table::print_transcript_list(&results);
            }
        }

        Commands::Show {
            id,
            segments,
            speaker,
            text,
        } => {
            let t = kb.store.require(&id)?;
            if json_output {
                json_out::print_json(&t)?;
            } else {
                table::print_transcript_detail(&t, &kb.registry()?);
                if segments {
                    println!();
                    table::print_segments(&t.segments, speaker.as_deref());
                }
                if text {
                    println!("\n{}", t.text);
                }
            }
        }

        Commands::Delete { id, force } => {
            let t = kb.store.require(&id)?;

            if !force {
                eprint!("Delete \"{}\" ({})? [y/N] ", t.title, id);
                let mut answer = String::new();
                std::io::stdin().read_line(&mut answer)?;
                if !answer.trim().eq_ignore_ascii_case("y") {
                    println!("Cancelled.");
                    return Ok(());
                }
            }

            kb.delete_transcript(&id)?;
            println!("Deleted: {} ({})", t.title, id);
        }

        Commands::Index { command } => match command {
            IndexCommand::Rebuild => {
                let n = kb.rebuild_index()?;
                println!("Indexed {n} transcript{}", plural(n));
            }
            IndexCommand::Info => {
                let index = kb.index()?;
                let stats = index.stats()?;
                if json_output {
                    json_out::print_json(&serde_json::json!({
                        "version": env!("CARGO_PKG_VERSION"),
                        "schema_version": index.schema_version(),
                        "index_path": index.path.display().to_string(),
                        "db_size_bytes": stats.db_size_bytes,
                        "transcripts": stats.transcripts,
                    }))?;
                } else {
                    println!("kb v{}", env!("CARGO_PKG_VERSION"));
                    println!("  Root:        {}", kb.paths.root.display());
                    println!("  Schema:      v{}", index.schema_version());
                    println!("  Index:       {}", index.path.display());
                    println!("  Transcripts: {}", stats.transcripts);
                }
            }
        },

        Commands::Stats => {
            let stats = kb.index()?.stats()?;
            let items = list_items(
                &kb.store.list()?,
                &kb.catalog()?,
                &kb.ledger()?,
                &QueueFilter::default(),
            );
            let counts = count_views(&items);
            if json_output {
                json_out::print_json(&serde_json::json!({
                    "index": stats,
                    "actions": counts,
                }))?;
            } else {
                table::print_stats(&stats, &counts, &kb.registry()?);
            }
        }

        Commands::Config { command } => match command {
            ConfigCommand::Init => {
                if config::init_config(&kb.paths.root)? {
                    println!("Created {}", config::config_path(&kb.paths.root).display());
                } else {
                    println!(
                        "Config already exists: {}",
                        config::config_path(&kb.paths.root).display()
                    );
                }
            }
            ConfigCommand::Show => {
                if json_output {
                    json_out::print_json(&kb.config)?;
                } else {
                    println!("{}", kb.config.display_redacted());
                }
            }
        },

        Commands::Serve {
            host,
            port,
            api_key,
        } => {
            let host = host.unwrap_or_else(|| kb.config.server.host.clone());
            let port = port.unwrap_or(kb.config.server.port);
            let addr: std::net::SocketAddr = format!("{host}:{port}")
                .parse()
                .with_context(|| format!("Invalid listen address: {host}:{port}"))?;

            let llm: Option<Arc<dyn LlmBackend>> =
                match AnthropicClient::from_config(&kb.config.llm, api_key.as_deref()) {
                    Ok(client) => Some(Arc::new(client)),
                    Err(e) => {
                        warn!("LLM disabled, judge/iterate will fail: {e:#}");
                        None
                    }
                };
            let state = Arc::new(AppState::new(kb, llm));
            tokio::runtime::Runtime::new()?.block_on(server::serve(state, addr))?;
        }

        #[cfg(unix)]
        Commands::Daemon { command } => run_daemon(kb, command, json_output)?,
    }

    Ok(())
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Analyze each transcript, continuing past failures. With no `types`, each
/// transcript gets its decimal's default analyses.
fn run_analyses(
    kb: &Kb,
    llm: &dyn LlmBackend,
    ids: &[String],
    types: &[String],
    force: bool,
    json_output: bool,
) -> Result<()> {
    let catalog = kb.catalog()?;
    let registry = kb.registry()?;
    let analyzer = Analyzer {
        catalog: &catalog,
        store: &kb.store,
        registry: &registry,
        llm,
    };

    let mut reports = Vec::new();
    let mut failed = 0;
    for id in ids {
        let requested = if types.is_empty() {
            analyzer.default_analyses(&kb.store.require(id)?)
        } else {
            types.to_vec()
        };
        if requested.is_empty() {
            warn!("{id}: no analyses requested and no decimal defaults");
            continue;
        }

        match analyzer.run(id, &requested, force) {
            Ok(report) => {
                kb.reindex_id(id)?;
                if !json_output {
                    table::print_run_report(&report);
                }
                reports.push(report);
            }
            Err(e) => {
                error!("{e:#}");
                eprintln!("{id}: {e:#}");
                failed += 1;
            }
        }
    }

    if json_output {
        json_out::print_json(&reports)?;
    }
    if failed > 0 {
        bail!("{failed} transcript{} failed to analyze", plural(failed));
    }
    Ok(())
}

fn run_actions(kb: &Kb, command: ActionsCommand, json_output: bool) -> Result<()> {
    let catalog = kb.catalog()?;
    let ledger_path = kb.paths.action_state_file();

    let (id, event) = match command {
        ActionsCommand::List {
            view,
            decimal,
            analysis_type,
        } => {
            let view = view
                .as_deref()
                .map(|v| {
                    View::from_str(v).with_context(|| {
                        format!("Unknown view: {v}. Use: queue, review, posting, archive")
                    })
                })
                .transpose()?;
            let filter = QueueFilter {
                view: None,
                decimal,
                analysis_type,
            };
            let all = list_items(&kb.store.list()?, &catalog, &kb.ledger()?, &filter);
            let counts = count_views(&all);
            let items: Vec<_> = all
                .into_iter()
                .filter(|i| view.map_or(true, |v| i.view == v))
                .collect();
            if json_output {
                json_out::print_json(&serde_json::json!({ "items": items, "counts": counts }))?;
            } else {
                table::print_action_items(&items, &counts);
            }
            return Ok(());
        }
        ActionsCommand::Show { id } => {
            let item = get_item(&kb.store, &catalog, &kb.ledger()?, &ActionKey::parse(&id)?)?;
            if json_output {
                json_out::print_json(&item)?;
            } else {
                table::print_action_detail(&item);
            }
            return Ok(());
        }
        ActionsCommand::Iterate {
            id,
            feedback,
            api_key,
        } => {
            let key = ActionKey::parse(&id)?;
            let item = with_refiner(kb, &catalog, &ledger_path, api_key, |r| {
                r.iterate(&key, feedback.as_deref())
            })?;
            kb.reindex_id(&key.transcript_id)?;
            if json_output {
                json_out::print_json(&item)?;
            } else {
                table::print_action_detail(&item);
            }
            return Ok(());
        }
        ActionsCommand::Judge { id, api_key } => {
            let key = ActionKey::parse(&id)?;
            let (verdict, item) =
                with_refiner(kb, &catalog, &ledger_path, api_key, |r| r.judge(&key))?;
            kb.reindex_id(&key.transcript_id)?;
            if json_output {
                json_out::print_json(&serde_json::json!({ "verdict": verdict, "item": item }))?;
            } else {
                print_verdict(&verdict);
                println!("\n{}: {}", item.id, item.status);
            }
            return Ok(());
        }
        ActionsCommand::Refine { id, api_key } => {
            let key = ActionKey::parse(&id)?;
            let report = with_refiner(kb, &catalog, &ledger_path, api_key, |r| r.refine(&key))?;
            kb.reindex_id(&key.transcript_id)?;
            if json_output {
                json_out::print_json(&report)?;
            } else {
                for v in &report.verdicts {
                    print_verdict(v);
                }
                println!("\n{}: {}", report.item.id, report.item.status);
                if !report.ready {
                    println!("Rounds exhausted; left staged for review.");
                }
            }
            return Ok(());
        }
        ActionsCommand::Approve { id } => (id, ActionEvent::Approve),
        ActionsCommand::Ready { id } => (id, ActionEvent::Ready),
        ActionsCommand::Posted { id } => (id, ActionEvent::Posted),
        ActionsCommand::Done { id } => (id, ActionEvent::Done),
        ActionsCommand::Skip { id } => (id, ActionEvent::Skip),
        ActionsCommand::Reopen { id } => (id, ActionEvent::Reopen),
    };

    let key = ActionKey::parse(&id)?;
    let item = apply_event(&kb.store, &catalog, &ledger_path, &key, event)?;
    if json_output {
        json_out::print_json(&item)?;
    } else {
        println!("{}: {}", item.id, item.status);
    }
    Ok(())
}

/// Build an LLM-backed refiner for one command.
fn with_refiner<T>(
    kb: &Kb,
    catalog: &AnalysisCatalog,
    ledger_path: &Path,
    api_key: Option<String>,
    f: impl FnOnce(&Refiner) -> Result<T>,
) -> Result<T> {
    let llm = AnthropicClient::from_config(&kb.config.llm, api_key.as_deref())?;
    let registry = kb.registry()?;
    let analyzer = Analyzer {
        catalog,
        store: &kb.store,
        registry: &registry,
        llm: &llm,
    };
    f(&Refiner {
        analyzer: &analyzer,
        ledger_path,
        commit_lock: None,
    })
}

fn print_verdict(v: &Verdict) {
    let mark = if v.passed { "pass" } else { "fail" };
    println!("score {:.1} ({mark})", v.score);
    if !v.feedback.is_empty() {
        println!("  {}", v.feedback);
    }
}

fn run_registry(kb: &Kb, command: RegistryCommand, json_output: bool) -> Result<()> {
    let path = kb.paths.registry_file();
    let mut registry = kb.registry()?;

    match command {
        RegistryCommand::List => {
            if json_output {
                json_out::print_json(&registry)?;
            } else {
                table::print_registry(&registry);
            }
            return Ok(());
        }
        RegistryCommand::Add {
            code,
            name,
            description,
            analyses,
        } => {
            warn_unknown_analyses(kb, &analyses)?;
            registry.add_decimal(
                &code,
                Decimal {
                    name,
                    description,
                    default_analyses: analyses,
                },
            )?;
            println!("Added {}", registry.label(&code));
        }
        RegistryCommand::Remove { code } => {
            let d = registry.remove_decimal(&code)?;
            println!("Removed {code} {}", d.name);
        }
        RegistryCommand::SetAnalyses { code, analyses } => {
            warn_unknown_analyses(kb, &analyses)?;
            registry.set_default_analyses(&code, analyses)?;
            println!(
                "{}: {}",
                registry.label(&code),
                registry.effective_analyses(&code).join(", ")
            );
        }
        RegistryCommand::TagAdd { name, description } => {
            registry.add_tag(&name, &description)?;
            println!("Added tag {name}");
        }
        RegistryCommand::TagRemove { name } => {
            registry.remove_tag(&name)?;
            println!("Removed tag {name}");
        }
    }

    registry.save(&path)
}

fn warn_unknown_analyses(kb: &Kb, names: &[String]) -> Result<()> {
    let catalog = kb.catalog()?;
    for name in names {
        if catalog.get(name).is_none() {
            warn!("No prompt file for analysis type {name}");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn run_daemon(kb: Kb, command: DaemonCommand, json_output: bool) -> Result<()> {
    use kb::daemon::{self, control, control::ControlCommand};

    let socket = kb.paths.daemon_socket();
    let command = match command {
        DaemonCommand::Run => return daemon::run(kb),
        DaemonCommand::Start => {
            let pid = daemon::start(&kb.paths.root)?;
            println!("Daemon started (pid {pid})");
            return Ok(());
        }
        DaemonCommand::Stop => {
            daemon::stop(&kb.paths.root)?;
            println!("Daemon stopped");
            return Ok(());
        }
        DaemonCommand::Status => ControlCommand::Status,
        DaemonCommand::Toggle => ControlCommand::Toggle,
        DaemonCommand::Cancel => ControlCommand::Cancel,
    };

    let reply = control::send(&socket, command)?;
    if json_output {
        json_out::print_json(&reply)?;
    } else {
        let status = &reply.status;
        println!("{}", status.phase.name());
        if !reply.message.is_empty() {
            println!("  {}", reply.message);
        }
        if let Some(e) = &status.last_error {
            println!("  last error: {e}");
        }
        if let Some(t) = &status.last_text {
            println!("  last text:  {t}");
        }
    }
    if !reply.ok {
        bail!("{}", reply.message);
    }
    Ok(())
}
