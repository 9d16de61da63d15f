use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{Context, IntoDiagnostic, Result};
use tessera_core::{file_identity, OutputFormat, SearchResult, TesseraConfig, VectorBackend};
use tessera_history::resolver::{ChangeSetResolver, ResolverStats};
use tessera_history::vcs::{GitRepository, VersionControl};
use tessera_index::cache::{CacheStats, ContentAddressedCache};
use tessera_index::embedding::HttpEmbeddingClient;
use tessera_index::graph::{GraphStoreGateway, Neo4jGraphStore, NullGraphStore};
use tessera_index::indexer::{IndexOutcome, Indexer};
use tessera_index::pipeline::{EmbeddingPipeline, PipelineOptions, StopSignal};
use tessera_index::qdrant::QdrantStore;
use tessera_index::search::{index_statistics, related_files, HybridRanker, IndexStatistics};
use tessera_index::store::{SqliteVectorStore, VectorStoreGateway};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tessera",
    version,
    about = "Incremental semantic code search",
    long_about = "Tessera keeps a semantic index of a git repository up to date.\n\n\
        Only files changed since the last indexed revision are re-embedded, and\n\
        embeddings are cached by content hash so unchanged bytes are never sent\n\
        to the provider twice. Queries combine vector similarity with code-graph\n\
        signals.\n\n\
        Examples:\n  tessera init\n  tessera index\n  tessera search \"where are retries configured\"\n  tessera related src/auth.rs\n  tessera status --format json"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (default: .tessera.toml in the repository root)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format: text, json, markdown
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Embed files changed since the last indexed revision
    #[command(long_about = "Embed files changed since the last indexed revision.\n\n\
        The first run indexes every tracked file with a configured extension.\n\
        Later runs only process the git diff against the recorded revision.\n\
        The recorded revision advances only when every file was uploaded, so an\n\
        interrupted run (Ctrl-C) is simply repeated next time.\n\n\
        Examples:\n  tessera index\n  tessera index --path ../other-repo")]
    Index {
        /// Repository path (default: current directory)
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Rank indexed files against a natural-language query
    #[command(long_about = "Rank indexed files against a natural-language query.\n\n\
        Results are ordered by a hybrid score mixing semantic similarity with\n\
        call-graph connectivity. If the graph store is disabled or unreachable,\n\
        ranking falls back to semantic similarity alone.\n\n\
        Examples:\n  tessera search \"parse config file\"\n  tessera search \"retry policy\" --limit 5 --no-graph")]
    Search {
        /// Natural-language query
        query: String,
        /// Repository path (default: current directory)
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Maximum number of results (default: search.limit)
        #[arg(long)]
        limit: Option<usize>,
        /// Drop candidates below this similarity (default: search.min_semantic_score)
        #[arg(long)]
        min_score: Option<f64>,
        /// Rank on semantic similarity only
        #[arg(long)]
        no_graph: bool,
    },
    /// List files connected to a file through the call graph
    #[command(long_about = "List files connected to a file through the call graph.\n\n\
        Follows call edges in either direction up to --depth hops and prints the\n\
        files of the modules reached. Requires [graph] enabled = true.\n\n\
        Examples:\n  tessera related src/auth.rs\n  tessera related src/auth.rs --depth 3 --limit 20")]
    Related {
        /// File to start from
        file: PathBuf,
        /// Repository path (default: current directory)
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Maximum call hops, 1 to 5
        #[arg(long, default_value_t = 2)]
        depth: usize,
        /// Maximum number of files
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show index, cache, vector store, and graph status
    Status {
        /// Repository path (default: current directory)
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Inspect or clear the embedding cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
        /// Repository path (default: current directory)
        #[arg(long, default_value = ".", global = true)]
        path: PathBuf,
    },
    /// Create a default .tessera.toml configuration file
    #[command(long_about = "Create a default .tessera.toml configuration file.\n\n\
        Generates a template with every available option.\n\
        Fails if .tessera.toml already exists.")]
    Init,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cached entry count and size
    Stats,
    /// Delete every cached embedding
    Clear,
}

const DEFAULT_CONFIG: &str = r#"# Tessera configuration

[embedding]
# provider = "ollama"            # "ollama", "voyage", or "openai"
# model = "nomic-embed-text"
# dimensions = 768
# base_url = "http://localhost:11434"
# api_key = "..."                # or VOYAGE_API_KEY / OPENAI_API_KEY
# timeout_secs = 90
# max_input_chars = 8000

[vector_store]
# backend = "sqlite"             # "sqlite" (local file) or "qdrant"
# url = "http://localhost:6333"
# collection = "code"
# timeout_secs = 30

[graph]
# enabled = false
# url = "http://localhost:7474"
# database = "neo4j"
# user = "neo4j"
# password = "..."
# timeout_secs = 10

[index]
# extensions = ["rs", "py", "ts", "js", "go", "java", "bsl"]
# tracked_pattern = "*"
# batch_size = 100
# workers = 4
# history_limit = 10
# state_dir = ".tessera"
# vcs_timeout_secs = 30

[cache]
# summary_every = 10

[search]
# limit = 10
# min_semantic_score = 0.3
# include_graph = true
# oversample = 2
# saturation = 5.0

[search.weights]
# semantic = 0.6
# incoming = 0.2
# outgoing = 0.1
# connections = 0.1

[search.labels]
# excellent = 0.8
# good = 0.6
# fair = 0.4
"#;

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .into_diagnostic()?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Init => {
            let path = Path::new(".tessera.toml");
            if path.exists() {
                miette::bail!(".tessera.toml already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created .tessera.toml with default configuration");
        }
        Command::Index { ref path } => {
            let repo = GitRepository::open(path)?;
            let config = load_config(cli.config.as_deref(), repo.root())?;
            let outcome = run_index(repo, &config).await?;
            print_outcome(&outcome, cli.format)?;
        }
        Command::Search {
            ref query,
            ref path,
            limit,
            min_score,
            no_graph,
        } => {
            let repo = GitRepository::open(path)?;
            let config = load_config(cli.config.as_deref(), repo.root())?;
            let state_dir = repo.root().join(&config.index.state_dir);

            let provider = Arc::new(HttpEmbeddingClient::with_config(&config.embedding)?);
            let store = open_store(&config, &state_dir)?;
            let graph = open_graph(&config, !no_graph)?;
            let ranker = HybridRanker::new(provider, store, graph, &config);

            let mut options = ranker.default_options().clone();
            if let Some(limit) = limit {
                options.limit = limit;
            }
            if let Some(min_score) = min_score {
                options.min_semantic_score = min_score;
            }
            if no_graph {
                options.include_graph = false;
            }

            let results = ranker.search(query, &options).await?;
            print_results(query, &results, cli.format)?;
        }
        Command::Related {
            ref file,
            ref path,
            depth,
            limit,
        } => {
            let repo = GitRepository::open(path)?;
            let config = load_config(cli.config.as_deref(), repo.root())?;
            if !config.graph.enabled {
                miette::bail!(
                    help = "set enabled = true under [graph] in .tessera.toml",
                    "the code graph is disabled"
                );
            }
            let root = std::fs::canonicalize(repo.root()).into_diagnostic()?;
            let file = std::fs::canonicalize(file)
                .into_diagnostic()
                .wrap_err_with(|| format!("cannot resolve {}", file.display()))?;
            let identity = file_identity(&root, &file);

            let graph = open_graph(&config, true)?;
            let timeout = Duration::from_secs(config.graph.timeout_secs.max(1));
            let files = related_files(graph.as_ref(), &identity, depth, limit, timeout).await?;
            print_related(&identity, &files, cli.format)?;
        }
        Command::Status { ref path } => {
            let repo = GitRepository::open(path)?;
            let config = load_config(cli.config.as_deref(), repo.root())?;
            let root = repo.root().to_path_buf();
            let state_dir = root.join(&config.index.state_dir);

            let resolver = ChangeSetResolver::new(
                Arc::new(repo),
                state_dir.join("index-state.json"),
                &config.index,
            );
            let index = resolver.statistics().await?;
            let cache = open_cache(&config, &root)?.stats();
            let store = open_store(&config, &state_dir)?;
            let graph = open_graph(&config, true)?;
            let stores = index_statistics(
                store.as_ref(),
                graph.as_ref(),
                &config.vector_store.collection,
                Duration::from_secs(config.vector_store.timeout_secs.max(1)),
            )
            .await?;
            print_status(&index, &cache, &stores, config.graph.enabled, cli.format)?;
        }
        Command::Cache {
            ref action,
            ref path,
        } => {
            let repo = GitRepository::open(path)?;
            let config = load_config(cli.config.as_deref(), repo.root())?;
            let cache = open_cache(&config, repo.root())?;

            match action {
                CacheAction::Stats => {
                    let stats = cache.stats();
                    if cli.format == OutputFormat::Json {
                        println!(
                            "{}",
                            serde_json::to_string_pretty(&stats).into_diagnostic()?
                        );
                    } else {
                        print_cache_stats(&stats);
                    }
                }
                CacheAction::Clear => {
                    let before = cache.stats().total_cached;
                    cache.clear()?;
                    println!("Cleared {before} cached embeddings");
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(explicit: Option<&Path>, root: &Path) -> Result<TesseraConfig> {
    let config = match explicit {
        Some(path) => TesseraConfig::from_file(path)
            .wrap_err_with(|| format!("failed to load {}", path.display()))?,
        None => {
            let default_path = root.join(".tessera.toml");
            if default_path.exists() {
                TesseraConfig::from_file(&default_path)?
            } else {
                TesseraConfig::default()
            }
        }
    };
    config.validate()?;
    Ok(config)
}

fn open_cache(config: &TesseraConfig, root: &Path) -> Result<ContentAddressedCache> {
    let state_dir = root.join(&config.index.state_dir);
    std::fs::create_dir_all(&state_dir)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to create {}", state_dir.display()))?;
    let cache = ContentAddressedCache::open(&state_dir.join("cache.db"), config.cache.summary_every)?
        .rooted_at(root);
    Ok(cache)
}

/// Neo4j when the graph is enabled and wanted, otherwise a graph that knows
/// nothing.
fn open_graph(config: &TesseraConfig, wanted: bool) -> Result<Arc<dyn GraphStoreGateway>> {
    let graph: Arc<dyn GraphStoreGateway> = if config.graph.enabled && wanted {
        Arc::new(Neo4jGraphStore::with_config(&config.graph)?)
    } else {
        Arc::new(NullGraphStore)
    };
    Ok(graph)
}

fn open_store(config: &TesseraConfig, state_dir: &Path) -> Result<Arc<dyn VectorStoreGateway>> {
    let store: Arc<dyn VectorStoreGateway> = match config.vector_store.backend {
        VectorBackend::Sqlite => {
            std::fs::create_dir_all(state_dir).into_diagnostic()?;
            Arc::new(SqliteVectorStore::open(&state_dir.join("vectors.db"))?)
        }
        VectorBackend::Qdrant => Arc::new(QdrantStore::with_config(&config.vector_store)?),
    };
    Ok(store)
}

async fn run_index(repo: GitRepository, config: &TesseraConfig) -> Result<IndexOutcome> {
    let root = repo.root().to_path_buf();
    let state_dir = root.join(&config.index.state_dir);

    let cache = Arc::new(open_cache(config, &root)?);
    let provider = Arc::new(HttpEmbeddingClient::with_config(&config.embedding)?);
    let store = open_store(config, &state_dir)?;

    let resolver = ChangeSetResolver::new(
        Arc::new(repo),
        state_dir.join("index-state.json"),
        &config.index,
    );
    let pipeline = EmbeddingPipeline::new(
        cache,
        provider,
        store,
        root,
        PipelineOptions::from_config(config),
    );
    let mut indexer = Indexer::new(resolver, pipeline, state_dir.join("index.lock"));

    let stop = StopSignal::new();
    let on_interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current batch");
            on_interrupt.stop();
        }
    });

    let spinner = if std::io::stderr().is_terminal() {
        let pb = indicatif::ProgressBar::new_spinner();
        pb.set_style(
            indicatif::ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner()),
        );
        pb.set_message("Indexing changed files...");
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    let result = indexer.run(&stop).await;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    Ok(result?)
}

fn print_outcome(outcome: &IndexOutcome, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::to_string_pretty(outcome).into_diagnostic()?
        );
        return Ok(());
    }

    let report = &outcome.report;
    println!(
        "{:?} run at {}: {} requested, {} uploaded ({} cached, {} embedded, {} skipped) in {:.1}s",
        outcome.mode,
        short_revision(&outcome.revision),
        report.requested,
        report.uploaded,
        report.cache_hits,
        report.embedded,
        report.skipped,
        report.elapsed.as_secs_f64(),
    );
    for failed in &report.failed {
        println!("  failed: {} ({})", failed.path.display(), failed.error);
    }
    if report.cancelled {
        println!("Run interrupted; the same change set will be retried next time.");
    } else if outcome.advanced {
        println!("Recorded revision {}", short_revision(&outcome.revision));
    } else if !report.failed.is_empty() {
        println!("Revision not recorded; failed files will be retried next time.");
    } else {
        println!("Index already up to date.");
    }
    Ok(())
}

fn print_results(query: &str, results: &[SearchResult], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(results).into_diagnostic()?
            );
        }
        OutputFormat::Markdown => {
            println!("## Results for `{query}`\n");
            println!("| # | File | Score | Semantic | Incoming | Outgoing | Related | Label |");
            println!("|---|------|-------|----------|-------|---------|---------|-------|");
            for (i, r) in results.iter().enumerate() {
                println!(
                    "| {} | `{}` | {:.3} | {:.3} | {} | {} | {} | {} |",
                    i + 1,
                    r.source_path,
                    r.hybrid_score,
                    r.semantic_score,
                    r.graph_metrics.incoming_calls,
                    r.graph_metrics.outgoing_calls,
                    r.graph_metrics.related_count,
                    r.relevance_label,
                );
            }
            let annotated: Vec<_> = results.iter().filter(|r| !r.neighbors.is_empty()).collect();
            if !annotated.is_empty() {
                println!("\n### Call graph\n");
                for r in annotated {
                    println!("- `{}`", r.source_path);
                    print_names("  - called by", &r.neighbors.called_by);
                    print_names("  - calls", &r.neighbors.calls_to);
                    print_names("  - related modules", &r.neighbors.related_modules);
                }
            }
        }
        OutputFormat::Text => {
            if results.is_empty() {
                println!("No results for \"{query}\"");
                return Ok(());
            }
            for (i, r) in results.iter().enumerate() {
                println!(
                    "{:>2}. {} [{:.3} {}] semantic {:.3}",
                    i + 1,
                    r.source_path,
                    r.hybrid_score,
                    r.relevance_label,
                    r.semantic_score,
                );
                if let Some(preview) = r.preview.as_deref().and_then(|p| p.lines().next()) {
                    println!("    {}", preview.trim());
                }
                print_names("    called by", &r.neighbors.called_by);
                print_names("    calls", &r.neighbors.calls_to);
                print_names("    related modules", &r.neighbors.related_modules);
            }
        }
    }
    Ok(())
}

fn print_names(heading: &str, names: &[String]) {
    if !names.is_empty() {
        println!("{heading}: {}", names.join(", "));
    }
}

fn print_related(file: &str, files: &[String], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let related = serde_json::json!({ "file": file, "related": files });
            println!(
                "{}",
                serde_json::to_string_pretty(&related).into_diagnostic()?
            );
        }
        OutputFormat::Markdown => {
            println!("## Files related to `{file}`\n");
            for f in files {
                println!("- `{f}`");
            }
        }
        OutputFormat::Text => {
            if files.is_empty() {
                println!("No related files for {file}");
            }
            for f in files {
                println!("{f}");
            }
        }
    }
    Ok(())
}

fn print_status(
    index: &ResolverStats,
    cache: &CacheStats,
    stores: &IndexStatistics,
    graph_enabled: bool,
    format: OutputFormat,
) -> Result<()> {
    let revision = index.last_revision.as_deref().unwrap_or("none");
    let last_indexed = index.last_indexed_at.map(|at| at.to_rfc3339());
    match format {
        OutputFormat::Json => {
            let status = serde_json::json!({
                "index": index,
                "cache": cache,
                "vectorStore": {
                    "collection": stores.collection,
                    "points": stores.points,
                },
                "graph": stores.graph.filter(|_| graph_enabled),
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&status).into_diagnostic()?
            );
        }
        OutputFormat::Markdown => {
            println!("## Index status\n");
            println!("| Field | Value |");
            println!("|-------|-------|");
            println!("| Phase | {:?} |", index.phase);
            println!("| Last revision | `{revision}` |");
            if let Some(at) = &last_indexed {
                println!("| Last indexed | {at} |");
            }
            println!("| Recorded runs | {} |", index.total_runs);
            println!("| Tracked files | {} |", index.tracked_files);
            println!(
                "| Vector store | {} points in `{}` |",
                stores.points, stores.collection
            );
            println!("| Cached entries | {} |", cache.total_cached);
            println!("| Cache size | {} bytes |", cache.approx_size_bytes);
            if graph_enabled {
                match &stores.graph {
                    Some(g) => println!(
                        "| Code graph | {} modules, {} functions, {} procedures, {} calls |",
                        g.modules, g.functions, g.procedures, g.calls
                    ),
                    None => println!("| Code graph | unavailable |"),
                }
            }
        }
        OutputFormat::Text => {
            println!("Phase:          {:?}", index.phase);
            println!("Last revision:  {revision}");
            if let Some(at) = &last_indexed {
                println!("Last indexed:   {at}");
            }
            println!("Recorded runs:  {}", index.total_runs);
            println!("Tracked files:  {}", index.tracked_files);
            println!(
                "Vector store:   {} points in '{}'",
                stores.points, stores.collection
            );
            print_cache_stats(cache);
            if graph_enabled {
                match &stores.graph {
                    Some(g) => println!(
                        "Code graph:     {} modules, {} functions, {} procedures, {} calls",
                        g.modules, g.functions, g.procedures, g.calls
                    ),
                    None => println!("Code graph:     unavailable"),
                }
            }
        }
    }
    Ok(())
}

fn print_cache_stats(stats: &CacheStats) {
    println!("Cached entries: {}", stats.total_cached);
    println!("Cache size:     {} bytes", stats.approx_size_bytes);
}

fn short_revision(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}
