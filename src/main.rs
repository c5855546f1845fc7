//! # extres
//!
//! 外部资源映射存储的命令行入口：导入、点查、压缩、统计。

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use external_resources::{
    lookup, BatchLoader, KeyLayout, LoaderOptions, MappingStore, StoreOptions, ValueLayout,
};

#[derive(Parser)]
#[command(name = "extres")]
#[command(about = "External resource mapping store: import CSV mappings and resolve text IDs")]
struct Cli {
    /// 存储目录
    #[arg(long, default_value = "db")]
    db: PathBuf,

    /// 输出 DEBUG 日志
    #[arg(short, long)]
    verbose: bool,

    /// 单个事务的字节上限
    #[arg(long)]
    max_txn_bytes: Option<usize>,

    /// 单个事务的条目上限
    #[arg(long)]
    max_txn_entries: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ValueArg {
    ProviderUrl,
    UrlOnly,
}

#[derive(Subcommand)]
enum Commands {
    /// 导入 CSV 映射文件（.gz / .csvz 按 gzip 读取）
    Import {
        files: Vec<PathBuf>,
        /// 字段分隔符
        #[arg(long, default_value_t = ',')]
        delimiter: char,
        /// corpus / document / text 分列存放
        #[arg(long)]
        split_key: bool,
        #[arg(long, value_enum, default_value = "provider-url")]
        value: ValueArg,
    },
    /// 查询一个文本对应的外部资源
    Lookup {
        corpus:   String,
        document: String,
        text:     String,
    },
    /// 重写提交日志，丢弃被覆盖的旧值
    Compact,
    /// 打印存储统计
    Stats,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut options = StoreOptions::default();
    if let Some(bytes) = cli.max_txn_bytes {
        options = options.with_max_txn_bytes(bytes);
    }
    if let Some(entries) = cli.max_txn_entries {
        options = options.with_max_txn_entries(entries);
    }

    let store = MappingStore::open_with(&cli.db, options)
        .with_context(|| format!("cannot open store at {}", cli.db.display()))?;

    let code = match cli.command {
        Commands::Import { files, delimiter, split_key, value } => {
            let delimiter = u8::try_from(delimiter)
                .ok()
                .filter(u8::is_ascii)
                .context("delimiter must be a single ASCII character")?;
            let opts = LoaderOptions::default()
                .with_delimiter(delimiter)
                .with_key_layout(if split_key { KeyLayout::Split } else { KeyLayout::Composite })
                .with_value_layout(match value {
                    ValueArg::ProviderUrl => ValueLayout::ProviderUrl,
                    ValueArg::UrlOnly     => ValueLayout::UrlOnly,
                });

            let loader = BatchLoader::new(&store).with_options(opts);
            for file in &files {
                let summary = loader
                    .load_path(file)
                    .with_context(|| format!("import of {} failed", file.display()))?;
                info!(file = %file.display(), records = summary.records,
                    commits = summary.commits, "imported");
            }
            ExitCode::SUCCESS
        }
        Commands::Lookup { corpus, document, text } => {
            let outcome = lookup(&store, &corpus, &document, &text);
            let found   = outcome.is_hit();
            let (_, body) = outcome.into_response();
            println!("{}", String::from_utf8_lossy(&body));
            if found { ExitCode::SUCCESS } else { ExitCode::from(1) }
        }
        Commands::Compact => {
            let stats = store.compact().context("compaction failed")?;
            println!("keys={} frames={} log_bytes={}", stats.keys, stats.frames, stats.log_bytes);
            ExitCode::SUCCESS
        }
        Commands::Stats => {
            let stats = store.stats();
            println!("keys={} frames={} log_bytes={}", stats.keys, stats.frames, stats.log_bytes);
            ExitCode::SUCCESS
        }
    };

    store.close().context("cannot close store")?;
    Ok(code)
}
