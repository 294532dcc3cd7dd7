use std::path::{Path, PathBuf};
use std::sync::Arc;

use alloy::primitives::B256;
use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use color_eyre::Section;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use epochlog_filter::{
    EpochTag, FilterEngine, FilterSpec, RawFilter, RawLimit, StringOrArray,
};
use epochlog_index::store::Store;
use epochlog_index::{
    BlockPosition, ExecutionListener, IndexConfig, LogEntry, ReceiptIndex, TransactionOutcome,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct AppContext {
    db_path: String,
    config: IndexConfig,
}

impl AppContext {
    fn open_store(&self) -> Result<Store> {
        if let Some(parent) = Path::new(&self.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent)?;
            }
        }
        Store::new(&self.db_path)
            .wrap_err_with(|| format!("failed to open block archive {}", self.db_path))
    }

    fn restore_index(&self, store: &Store) -> Result<Arc<ReceiptIndex>> {
        let index = store
            .restore_index(self.config.clone())
            .wrap_err("failed to rebuild receipt index from archive")?;
        Ok(Arc::new(index))
    }
}

#[derive(Parser, Debug)]
#[command(name = "epochlog")]
#[command(about = "Epoch-ordered receipt index and log filter")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[arg(
        long,
        global = true,
        env = "EPOCHLOG_DB_PATH",
        default_value = "data/epochlog.sqlite"
    )]
    db_path: String,

    /// Index configuration (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Archive mined and executed blocks from a JSON fixture file.
    Ingest(IngestArgs),
    /// Evaluate a log filter against the archived blocks.
    Query(QueryArgs),
    /// Resolve an epoch tag against the archived chain.
    Resolve(ResolveArgs),
    /// Show archive contents and chain progress.
    Status,
}

#[derive(Args, Debug)]
struct IngestArgs {
    #[arg(long)]
    file: PathBuf,
}

/// Arguments for the `query` subcommand.
///
/// Every `--topic` is one position: a hex word, a comma-separated list of
/// alternatives, or `*` for any value.
#[derive(Args, Debug)]
struct QueryArgs {
    #[arg(long)]
    from_epoch: Option<String>,

    #[arg(long)]
    to_epoch: Option<String>,

    #[arg(long)]
    block_hash: Vec<String>,

    #[arg(long)]
    address: Vec<String>,

    #[arg(long)]
    topic: Vec<String>,

    /// Keep only the last N matches (decimal or 0x hex).
    #[arg(long)]
    limit: Option<String>,

    /// Output format: table (default) or json.
    #[arg(long, default_value = "table")]
    output: String,
}

impl QueryArgs {
    fn to_raw_filter(&self) -> RawFilter {
        RawFilter {
            from_epoch: self.from_epoch.clone(),
            to_epoch: self.to_epoch.clone(),
            block_hashes: (!self.block_hash.is_empty()).then(|| self.block_hash.clone()),
            address: (!self.address.is_empty())
                .then(|| StringOrArray::Multiple(self.address.clone())),
            topics: (!self.topic.is_empty())
                .then(|| self.topic.iter().map(|t| parse_topic_arg(t)).collect()),
            limit: self.limit.clone().map(RawLimit::Text),
        }
    }
}

#[derive(Args, Debug)]
struct ResolveArgs {
    /// earliest, latest_state, latest_mined or an epoch number.
    tag: String,
}

/// One block in an ingest file. Blocks without `outcomes` are mined only.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockFixture {
    hash: B256,
    #[serde(flatten)]
    position: BlockPosition,
    #[serde(default)]
    outcomes: Option<Vec<TransactionOutcome>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    let config = match &cli.config {
        Some(path) => IndexConfig::from_json_file(path)?,
        None => IndexConfig::default(),
    };
    let ctx = AppContext {
        db_path: cli.db_path,
        config,
    };

    match cli.command {
        Commands::Ingest(args) => handle_ingest(&ctx, args).await,
        Commands::Query(args) => handle_query(&ctx, args).await,
        Commands::Resolve(args) => handle_resolve(&ctx, args),
        Commands::Status => handle_status(&ctx),
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

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn handle_ingest(ctx: &AppContext, args: IngestArgs) -> Result<()> {
    let text = tokio::fs::read_to_string(&args.file)
        .await
        .wrap_err_with(|| format!("failed to read {}", args.file.display()))?;
    let fixtures: Vec<BlockFixture> = serde_json::from_str(&text)
        .wrap_err_with(|| format!("failed to parse block fixtures in {}", args.file.display()))?;

    let store = ctx.open_store()?;
    let index = ctx.restore_index(&store)?;

    let pb = ProgressBar::new(fixtures.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} blocks")
            .wrap_err("failed to create progress style")?
            .progress_chars("#>-"),
    );

    let mut mined = 0usize;
    let mut executed = 0usize;
    let mut logs = 0usize;
    for fixture in fixtures {
        match fixture.outcomes {
            Some(outcomes) => {
                let block = index
                    .record_receipts(fixture.hash, fixture.position, outcomes)
                    .wrap_err_with(|| format!("rejected executed block {}", fixture.hash))?;
                logs += store
                    .insert_executed_block(&block)
                    .wrap_err_with(|| format!("failed to archive block {}", fixture.hash))?;
                executed += 1;
            }
            None => {
                index
                    .on_block_mined(fixture.hash, fixture.position)
                    .wrap_err_with(|| format!("rejected mined block {}", fixture.hash))?;
                store
                    .insert_mined_block(fixture.hash, &fixture.position)
                    .wrap_err_with(|| format!("failed to archive block {}", fixture.hash))?;
                mined += 1;
            }
        }
        pb.inc(1);
    }
    pb.finish_with_message("ingest completed");

    let marks = index.marks();
    info!(
        mined,
        executed,
        logs,
        latest_mined = marks.latest_mined,
        latest_state = marks.latest_state,
        "ingest completed"
    );
    Ok(())
}

async fn handle_query(ctx: &AppContext, args: QueryArgs) -> Result<()> {
    let spec = FilterSpec::normalize(args.to_raw_filter()).wrap_err("invalid filter")?;

    let store = ctx.open_store()?;
    let engine = FilterEngine::new(ctx.restore_index(&store)?);
    let cancel = CancellationToken::new();

    let mut worker = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || engine.evaluate_with(&spec, &cancel))
    };

    let outcome = tokio::select! {
        joined = &mut worker => joined.wrap_err("filter evaluation task failed")?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            worker.await.wrap_err("filter evaluation task failed")?
        }
    };

    let logs = match outcome {
        Ok(logs) => logs,
        Err(e) if e.is_retryable() => {
            return Err(eyre!(e)).suggestion("the scope is not executed yet; retry once it is");
        }
        Err(e) => return Err(eyre!(e)),
    };

    match args.output.as_str() {
        "json" => {
            let json = serde_json::to_string_pretty(&logs)
                .wrap_err("failed to serialize logs to JSON")?;
            println!("{json}");
        }
        _ => print_logs_table(&logs),
    }

    info!(matches = logs.len(), "query command completed");
    Ok(())
}

fn handle_resolve(ctx: &AppContext, args: ResolveArgs) -> Result<()> {
    let tag: EpochTag = args
        .tag
        .parse()
        .wrap_err_with(|| format!("invalid epoch tag {}", args.tag))?;

    let store = ctx.open_store()?;
    let engine = FilterEngine::new(ctx.restore_index(&store)?);
    let epoch = engine.resolve_epoch_tag(tag)?;
    println!("{tag} -> {epoch}");
    Ok(())
}

fn handle_status(ctx: &AppContext) -> Result<()> {
    let store = ctx.open_store()?;
    let (min_epoch, max_epoch, archived) = store
        .epoch_range()
        .wrap_err("failed to query archived epoch range")?;
    let stats = ctx.restore_index(&store)?.stats();

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Archive", ctx.db_path.as_str()]);
    table.add_row(vec![
        "Archived epochs".to_string(),
        if archived == 0 {
            "-".to_string()
        } else {
            format!("{min_epoch}..={max_epoch}")
        },
    ]);
    table.add_row(vec!["Known blocks".to_string(), stats.known_blocks.to_string()]);
    table.add_row(vec![
        "Executed blocks".to_string(),
        stats.executed_blocks.to_string(),
    ]);
    table.add_row(vec![
        "Executed pivots".to_string(),
        stats.executed_pivots.to_string(),
    ]);
    table.add_row(vec!["Receipts".to_string(), stats.receipts.to_string()]);
    table.add_row(vec!["Logs".to_string(), stats.logs.to_string()]);
    table.add_row(vec![
        "Latest mined epoch".to_string(),
        stats.marks.latest_mined.to_string(),
    ]);
    table.add_row(vec![
        "Latest state epoch".to_string(),
        stats.marks.latest_state.to_string(),
    ]);

    println!("\n{table}\n");
    Ok(())
}

fn print_logs_table(logs: &[LogEntry]) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Epoch", "Block", "Tx", "Log", "Address", "Topics", "Data",
    ]);

    for log in logs {
        let topics = log
            .topics
            .iter()
            .map(|t| truncate_hash(&t.to_string()))
            .collect::<Vec<_>>()
            .join("\n");
        table.add_row(vec![
            log.epoch_number.to_string(),
            truncate_hash(&log.block_hash.to_string()),
            log.transaction_index.to_string(),
            log.log_index.to_string(),
            truncate_hash(&log.address.to_string()),
            topics,
            format!("{} bytes", log.data.len()),
        ]);
    }

    println!("\n{table}\n");
    println!("{} matching log(s)", logs.len());
}

/// `*` (or nothing) is any value, a comma-separated list is one-of.
fn parse_topic_arg(value: &str) -> Option<StringOrArray> {
    let value = value.trim();
    if value.is_empty() || value == "*" {
        return None;
    }
    let words: Vec<String> = value.split(',').map(|w| w.trim().to_string()).collect();
    if words.len() == 1 {
        Some(StringOrArray::Single(value.to_string()))
    } else {
        Some(StringOrArray::Multiple(words))
    }
}

/// Truncate a hex hash/address for compact table display.
fn truncate_hash(hash: &str) -> String {
    if hash.len() > 14 {
        format!("{}…{}", &hash[..8], &hash[hash.len() - 4..])
    } else {
        hash.to_string()
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .wrap_err_with(|| format!("failed to create data directory {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_args_map_to_raw_positions() {
        assert_eq!(parse_topic_arg("*"), None);
        assert_eq!(parse_topic_arg(" "), None);
        assert_eq!(
            parse_topic_arg("0xaa"),
            Some(StringOrArray::Single("0xaa".to_string()))
        );
        assert_eq!(
            parse_topic_arg("0xaa, 0xbb"),
            Some(StringOrArray::Multiple(vec![
                "0xaa".to_string(),
                "0xbb".to_string()
            ]))
        );
    }

    #[test]
    fn every_subcommand_has_help() {
        use clap::CommandFactory;

        let cli = Cli::command();
        for sub in cli.get_subcommands() {
            assert!(
                sub.get_about().is_some(),
                "`{}` has no description",
                sub.get_name()
            );
        }
    }

    #[test]
    fn query_flags_build_raw_filter() {
        let cli = Cli::parse_from([
            "epochlog",
            "query",
            "--from-epoch",
            "0x1",
            "--topic",
            "*",
            "--topic",
            "0xaa",
            "--limit",
            "10",
        ]);
        let Commands::Query(args) = cli.command else {
            panic!("expected query command");
        };

        let raw = args.to_raw_filter();
        assert_eq!(raw.from_epoch.as_deref(), Some("0x1"));
        assert_eq!(raw.block_hashes, None);
        assert_eq!(raw.address, None);
        assert_eq!(
            raw.topics,
            Some(vec![None, Some(StringOrArray::Single("0xaa".to_string()))])
        );
        assert_eq!(raw.limit, Some(RawLimit::Text("10".to_string())));
    }

    #[test]
    fn fixtures_distinguish_mined_and_executed_blocks() {
        let json = format!(
            r#"[
                {{"hash": "{h1}", "epochNumber": 1, "pivotOrdinal": 0, "blockNumber": 1, "isPivot": true,
                  "outcomes": [{{"transactionHash": "{h1}", "outcomeStatus": "success",
                                 "logs": [{{"address": "0x00000000000000000000000000000000000000ee", "topics": ["{h2}"], "data": "0x"}}]}}]}},
                {{"hash": "{h2}", "epochNumber": 2, "pivotOrdinal": 0, "blockNumber": 2, "isPivot": true}}
            ]"#,
            h1 = B256::repeat_byte(1),
            h2 = B256::repeat_byte(2),
        );
        let fixtures: Vec<BlockFixture> = serde_json::from_str(&json).expect("valid fixtures");

        assert_eq!(fixtures.len(), 2);
        assert_eq!(fixtures[0].position.epoch_number, 1);
        assert_eq!(
            fixtures[0].outcomes.as_ref().map(|o| o[0].logs.len()),
            Some(1)
        );
        assert!(fixtures[1].outcomes.is_none());
    }
}
