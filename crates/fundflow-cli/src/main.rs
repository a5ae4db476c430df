use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use fundflow_analysis::classify::{ClassificationResult, ClusterClassifier};
use fundflow_analysis::config::{parse_stop_list, parse_timezone, PathNumbering, TraceConfig};
use fundflow_analysis::export::{export_csv, write_csv};
use fundflow_analysis::flow_graph::FlowGraph;
use fundflow_analysis::tracer::{FlowTracer, TraceReport};
use fundflow_analysis::ClassificationCache;
use fundflow_data::blockchair::BlockchairClient;
use fundflow_data::blockcypher::BlockCypherClient;
use fundflow_data::source::TransactionDataSource;
use fundflow_data::store::Store;
use fundflow_data::types::FundFlowRecord;
use fundflow_data::walletexplorer::WalletExplorerClient;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct AppContext {
    db_path: String,
    blockchair_api_key: Option<String>,
    blockcypher_token: Option<String>,
}

#[derive(Parser, Debug)]
#[command(name = "fundflow")]
#[command(about = "Forensic tracing of Bitcoin fund flows")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// SQLite database holding cached traces.
    #[arg(long, global = true, default_value = "data/fundflow.sqlite")]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Trace the funds a seed address received in a block.
    Trace(TraceArgs),
    /// Classify the cluster owning an address or a wallet id.
    Classify(ClassifyArgs),
    /// Inspect or prune cached traces.
    Cache(CacheArgs),
    /// Export a cached trace to CSV.
    Export(ExportArgs),
    /// Render a cached trace as an HTML flow graph.
    Graph(GraphArgs),
}

#[derive(Args, Debug)]
struct TraceArgs {
    /// Seed address.
    #[arg(long)]
    address: String,

    /// Block in which the seed received the funds to trace.
    #[arg(long)]
    start_block: u64,

    /// Fraction of the case total an output must exceed to be followed.
    #[arg(long, default_value_t = fundflow_analysis::config::DEFAULT_THRESHOLD)]
    threshold: f64,

    #[arg(long, default_value_t = fundflow_analysis::config::DEFAULT_MAX_HOPS)]
    max_hops: u32,

    /// Comma-separated cluster categories that end a path.
    #[arg(long, default_value = "exchange,mining,mixer,gambling,darknet")]
    stop_list: String,

    /// Timezone of reported event times.
    #[arg(long, default_value = "CET")]
    timezone: String,

    /// Transaction cap per address.
    #[arg(long, default_value_t = fundflow_analysis::config::DEFAULT_MAX_RECORDS)]
    max_records: usize,

    /// Transaction data provider: blockchair or blockcypher.
    #[arg(long, default_value = "blockchair")]
    provider: String,

    /// Path numbering on branches: global or offset.
    #[arg(long, default_value = "global")]
    path_numbering: String,

    /// Also write the ledger to this CSV file.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Also write the HTML flow graph to this file.
    #[arg(long)]
    graph: Option<PathBuf>,

    /// Do not store the trace in the cache database.
    #[arg(long)]
    no_cache: bool,

    /// Output format: table (default), json or csv.
    #[arg(long, default_value = "table")]
    output: String,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("target").required(true).args(["address", "wallet"])))]
struct ClassifyArgs {
    #[arg(long)]
    address: Option<String>,

    /// WalletExplorer wallet id.
    #[arg(long)]
    wallet: Option<String>,

    /// Output format: table (default) or json.
    #[arg(long, default_value = "table")]
    output: String,
}

#[derive(Args, Debug)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// List cached traces.
    List,
    /// Print the ledger of a cached trace.
    Show {
        #[arg(long)]
        id: i64,

        /// Output format: table (default), json or csv.
        #[arg(long, default_value = "table")]
        output: String,
    },
    /// Delete one cached trace.
    Delete {
        #[arg(long)]
        id: i64,
    },
    /// Delete every cached trace.
    Clear,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Cached trace id.
    #[arg(long)]
    id: i64,

    #[arg(long, default_value = "output/fund_flow_records.csv")]
    csv: PathBuf,
}

#[derive(Args, Debug)]
struct GraphArgs {
    /// Cached trace id.
    #[arg(long)]
    id: i64,

    #[arg(long, default_value = "output/fund_flow_graph.html")]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    let ctx = AppContext {
        db_path: cli.db_path,
        blockchair_api_key: std::env::var("BLOCKCHAIR_API_KEY").ok(),
        blockcypher_token: std::env::var("BLOCKCYPHER_TOKEN").ok(),
    };

    match cli.command {
        Commands::Trace(args) => handle_trace(&ctx, args).await,
        Commands::Classify(args) => handle_classify(args).await,
        Commands::Cache(args) => handle_cache(&ctx, args),
        Commands::Export(args) => handle_export(&ctx, args),
        Commands::Graph(args) => handle_graph(&ctx, args),
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn trace_config(args: &TraceArgs) -> Result<TraceConfig> {
    let config = TraceConfig {
        threshold: args.threshold,
        max_hops: args.max_hops,
        stop_list: parse_stop_list(&args.stop_list)?,
        timezone: parse_timezone(&args.timezone)?,
        max_records: args.max_records,
        path_numbering: args.path_numbering.parse::<PathNumbering>()?,
    };
    config.validate()?;
    Ok(config)
}

async fn handle_trace(ctx: &AppContext, args: TraceArgs) -> Result<()> {
    let config = trace_config(&args)?;

    let report = match args.provider.to_lowercase().as_str() {
        "blockchair" => {
            let source = BlockchairClient::new(ctx.blockchair_api_key.clone())?;
            run_trace(source, config, &args.address, args.start_block).await?
        }
        "blockcypher" => {
            let source = BlockCypherClient::new(ctx.blockcypher_token.clone())?;
            run_trace(source, config, &args.address, args.start_block).await?
        }
        _ => {
            return Err(eyre!(
                "unknown provider '{}'; use 'blockchair' or 'blockcypher'",
                args.provider
            ))
        }
    };

    let trace_id = if args.no_cache {
        None
    } else {
        let store = open_store(&ctx.db_path)?;
        Some(
            store
                .save_trace(
                    &report.root_address,
                    report.start_block,
                    report.case_total_btc,
                    &report.records,
                )
                .wrap_err("failed to cache trace")?,
        )
    };

    if let Some(path) = &args.csv {
        export_csv(&report.records, path)?;
    }
    if let Some(path) = &args.graph {
        FlowGraph::from_records(&report.records, &report.root_address).write_html(path)?;
    }

    match args.output.to_lowercase().as_str() {
        "table" => print_trace_table(&report, trace_id),
        "json" => {
            let json =
                serde_json::to_string_pretty(&report).wrap_err("failed to serialize JSON")?;
            println!("{json}");
        }
        "csv" => write_csv(&report.records, std::io::stdout().lock())?,
        _ => {
            return Err(eyre!(
                "unknown output format '{}'; use 'table', 'json', or 'csv'",
                args.output
            ))
        }
    }

    info!(
        root = %report.root_address,
        records = report.records.len(),
        trace_id = ?trace_id,
        "trace command completed"
    );
    Ok(())
}

async fn run_trace<S: TransactionDataSource>(
    source: S,
    config: TraceConfig,
    address: &str,
    start_block: u64,
) -> Result<TraceReport> {
    let classifier = ClusterClassifier::new(
        WalletExplorerClient::new()?,
        Arc::new(ClassificationCache::new()),
    );
    let tracer = FlowTracer::new(source, classifier, config)?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.set_message(format!("tracing {address} from block {start_block}"));
    pb.enable_steady_tick(std::time::Duration::from_millis(100));

    let report = tracer.trace(address, start_block).await;

    pb.finish_with_message(format!("trace completed: {} records", report.records.len()));
    Ok(report)
}

async fn handle_classify(args: ClassifyArgs) -> Result<()> {
    let classifier = ClusterClassifier::new(
        WalletExplorerClient::new()?,
        Arc::new(ClassificationCache::new()),
    );

    let result = match (&args.address, &args.wallet) {
        (Some(address), _) => classifier.classify(address).await,
        (None, Some(wallet)) => classifier.classify_cluster(wallet).await,
        (None, None) => return Err(eyre!("either --address or --wallet is required")),
    };

    match args.output.to_lowercase().as_str() {
        "json" => {
            let json =
                serde_json::to_string_pretty(&result).wrap_err("failed to serialize JSON")?;
            println!("{json}");
        }
        _ => print_classification_table(&args, &result),
    }
    Ok(())
}

fn handle_cache(ctx: &AppContext, args: CacheArgs) -> Result<()> {
    let store = open_store(&ctx.db_path)?;

    match args.command {
        CacheCommand::List => {
            let traces = store.list_traces().wrap_err("failed to list cached traces")?;
            let mut table = Table::new();
            table.load_preset(UTF8_BORDERS_ONLY);
            table.set_header(vec![
                "Id",
                "Root Address",
                "Start Block",
                "Case Total (BTC)",
                "Records",
                "Created",
            ]);
            for meta in &traces {
                table.add_row(vec![
                    meta.id.to_string(),
                    meta.root_address.clone(),
                    meta.start_block.to_string(),
                    format!("{:.8}", meta.case_total_btc),
                    meta.total_records.to_string(),
                    meta.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                ]);
            }
            println!("\n{table}\n");
        }
        CacheCommand::Show { id, output } => {
            let cached = store
                .load_trace(id)?
                .ok_or_else(|| eyre!("no cached trace with id {id}"))?;
            match output.to_lowercase().as_str() {
                "json" => {
                    let json = serde_json::to_string_pretty(&cached.records)
                        .wrap_err("failed to serialize JSON")?;
                    println!("{json}");
                }
                "csv" => write_csv(&cached.records, std::io::stdout().lock())?,
                _ => println!("\n{}\n", records_table(&cached.records)),
            }
        }
        CacheCommand::Delete { id } => {
            if store.delete_trace(id)? {
                println!("deleted cached trace {id}");
            } else {
                return Err(eyre!("no cached trace with id {id}"));
            }
        }
        CacheCommand::Clear => {
            let removed = store.clear()?;
            println!("deleted {removed} cached traces");
        }
    }
    Ok(())
}

fn handle_export(ctx: &AppContext, args: ExportArgs) -> Result<()> {
    let store = open_store(&ctx.db_path)?;
    let cached = store
        .load_trace(args.id)?
        .ok_or_else(|| eyre!("no cached trace with id {}", args.id))?;
    export_csv(&cached.records, &args.csv)?;
    println!("wrote {} records to {}", cached.records.len(), args.csv.display());
    Ok(())
}

fn handle_graph(ctx: &AppContext, args: GraphArgs) -> Result<()> {
    let store = open_store(&ctx.db_path)?;
    let cached = store
        .load_trace(args.id)?
        .ok_or_else(|| eyre!("no cached trace with id {}", args.id))?;
    let graph = FlowGraph::from_records(&cached.records, &cached.meta.root_address);
    graph.write_html(&args.out)?;
    println!(
        "wrote graph with {} nodes and {} edges to {}",
        graph.node_count(),
        graph.edge_count(),
        args.out.display()
    );
    Ok(())
}

fn open_store(db_path: &str) -> Result<Store> {
    if db_path != ":memory:" {
        if let Some(parent) = Path::new(db_path).parent() {
            ensure_dir(parent)?;
        }
    }
    Store::new(db_path).wrap_err("failed to open SQLite store")
}

fn records_table(records: &[FundFlowRecord]) -> Table {
    let mut sorted: Vec<&FundFlowRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.path_id.cmp(&b.path_id).then(a.hop.cmp(&b.hop)));

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Path",
        "Hop",
        "Follow",
        "Input",
        "Output",
        "Classification",
        "BTC",
        "Not Followed",
        "Tx",
        "Notes",
    ]);

    for record in sorted {
        table.add_row(vec![
            record.path_id.to_string(),
            record.hop.to_string(),
            if record.follow { "yes" } else { "no" }.to_string(),
            truncate_hash(&record.input),
            truncate_hash(&record.output),
            record.wallet_classification.to_string(),
            format!("{:.8}", record.btc),
            format!("{:.8}", record.btc_not_followed),
            truncate_hash(&record.txid),
            record.notes.clone(),
        ]);
    }
    table
}

fn print_trace_table(report: &TraceReport, trace_id: Option<i64>) {
    println!("\n{}\n", records_table(&report.records));

    let mut summary = Table::new();
    summary.load_preset(UTF8_BORDERS_ONLY);
    summary.set_header(vec!["Metric", "Value"]);
    summary.add_row(vec!["Root address", report.root_address.as_str()]);
    summary.add_row(vec!["Start block", &report.start_block.to_string()]);
    summary.add_row(vec!["Case total", &format!("{:.8} BTC", report.case_total_btc)]);
    summary.add_row(vec!["Records", &report.records.len().to_string()]);
    summary.add_row(vec!["Followed edges", &report.followed_count().to_string()]);
    summary.add_row(vec!["Deepest hop", &report.max_hop().to_string()]);
    summary.add_row(vec!["After-flow outputs", &report.after_flow.len().to_string()]);
    summary.add_row(vec!["Completeness warnings", &report.warnings.len().to_string()]);
    if let Some(id) = trace_id {
        summary.add_row(vec!["Cached trace id", &id.to_string()]);
    }
    println!("{summary}\n");

    for warning in &report.warnings {
        println!(
            "warning: {} (path {}, hop {}) hit the {}-transaction cap; its activity may be incomplete",
            warning.address, warning.path_id, warning.hop, warning.max_records
        );
    }
}

fn print_classification_table(args: &ClassifyArgs, result: &ClassificationResult) {
    let target = args
        .address
        .as_deref()
        .or(args.wallet.as_deref())
        .unwrap_or_default();

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Target", target]);
    table.add_row(vec!["Cluster type", result.cluster_type.as_str()]);
    table.add_row(vec!["Wallet id", result.wallet_id.as_deref().unwrap_or("N/A")]);
    table.add_row(vec!["Label", result.label.as_deref().unwrap_or("")]);
    table.add_row(vec!["Confidence", &format!("{:.0}%", result.confidence * 100.0)]);
    table.add_row(vec!["Description", result.description.as_str()]);
    println!("\n{table}\n");
}

/// Truncate an address or hash for compact table display.
fn truncate_hash(hash: &str) -> String {
    if hash.len() > 14 && hash.is_ascii() {
        format!("{}…{}", &hash[..8], &hash[hash.len() - 4..])
    } else {
        hash.to_string()
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(path)
        .wrap_err_with(|| format!("failed to create directory {}", path.display()))?;
    Ok(())
}
