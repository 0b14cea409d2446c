//! # sluice - タスクキューと retention のツール
//!
//! 使い方:
//!   sluice run                              # SIGINT/SIGTERM まで Foreman を動かす
//!   sluice enqueue examples.fast_task       # タスクを 1 つ積む
//!   sluice check                            # examples.fast_task を積む
//!   sluice stats --minutes 60               # 直近 1 時間のタスク別統計
//!   sluice evict --project 1 --max-event-count 10000
//!   sluice simulate --epochs 5              # 削除ポリシーを先まで回してみる

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use sluice_core::app::{example_tasks, forward_signals, App, AppBuilder};
use sluice_core::config::SluiceConfig;
use sluice_core::domain::{ProjectId, TaskArgs};
use sluice_core::error::ForemanError;
use sluice_core::impls::{FileNotifier, SqliteStore};
use sluice_core::ports::{StatStore, SystemClock};
use sluice_core::retention::{
    self, epoch_for, EvictionEngine, EvictionPolicy, ProjectQuota, QuotaBook, Simulator,
    SqliteEventStore,
};

#[derive(Parser)]
#[command(name = "sluice", version, about = "Database-backed background tasks")]
struct Cli {
    /// 設定ファイル（TOML）、なければ $SLUICE_CONFIG、それもなければデフォルト
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 詳細ログ
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Foreman を動かす
    Run,

    /// タスクを積む
    Enqueue {
        /// task name（`module.function`）
        task_name: String,

        /// 位置引数（JSON 配列）
        #[arg(long, default_value = "[]")]
        args: String,

        /// キーワード引数（JSON オブジェクト）
        #[arg(long, default_value = "{}")]
        kwargs: String,
    },

    /// examples.fast_task を積んで Foreman が仕事を拾うか確認する
    Check,

    /// タスク別統計を表示
    Stats {
        /// 窓（分）
        #[arg(long, default_value = "60")]
        minutes: u32,
    },

    /// プロジェクトのイベントを quota まで削除
    Evict {
        #[arg(long)]
        project: u64,

        #[arg(long)]
        max_event_count: u64,

        /// 削除の基準 epoch、省略時は現在
        #[arg(long)]
        epoch: Option<i64>,
    },

    /// ランダムなイベントで削除をシミュレート
    Simulate {
        #[arg(long, default_value = "0")]
        seed: u64,

        #[arg(long, default_value = "10")]
        epochs: u32,

        /// epoch ごとの新規イベント数
        #[arg(long, default_value = "100000")]
        inflow: u64,

        #[arg(long, default_value = "10000")]
        max_size: u64,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        "sluice=debug,sluice_core=debug"
    } else {
        "sluice=info,sluice_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();
}

fn event_engine(config: &SluiceConfig) -> Result<Arc<EvictionEngine>> {
    let path = &config.database.event_db;
    ensure_parent(path)?;
    let store = SqliteEventStore::open(path, config.database.query_timeout())
        .with_context(|| format!("opening event database {}", path.display()))?;
    Ok(Arc::new(EvictionEngine::new(
        Arc::new(store),
        EvictionPolicy::from(&config.retention),
    )))
}

fn task_store(config: &SluiceConfig) -> Result<Arc<SqliteStore>> {
    let path = &config.database.task_db;
    ensure_parent(path)?;
    let store = SqliteStore::open(path, config.database.query_timeout())
        .with_context(|| format!("opening task database {}", path.display()))?;
    Ok(Arc::new(store))
}

fn ensure_parent(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    Ok(())
}

fn build_app(config: &SluiceConfig) -> Result<App> {
    let app = AppBuilder::new()
        .add_loader(Arc::new(example_tasks::ExampleTasks))
        .build()?;
    retention::task::register(
        app.registry(),
        event_engine(config)?,
        Arc::new(QuotaBook::new()),
        Arc::new(SystemClock),
        config.retention.epoch_seconds,
    )?;
    Ok(app)
}

async fn run(config: SluiceConfig) -> Result<()> {
    let app = build_app(&config)?;
    let store = task_store(&config)?;
    let notifier = Arc::new(
        FileNotifier::listen(&config.foreman.wakeup_calls_dir).map_err(ForemanError::Notifier)?,
    );

    let foreman = app.foreman(config.foreman.clone(), store.clone(), store, notifier);
    let signals = forward_signals(foreman.handle()).context("installing signal handlers")?;

    let result = foreman.run().await;
    signals.abort();
    result?;
    Ok(())
}

async fn enqueue(config: &SluiceConfig, task_name: &str, args: TaskArgs) -> Result<()> {
    let app = build_app(config)?;
    let store = task_store(config)?;
    let notifier = Arc::new(FileNotifier::sender(&config.foreman.wakeup_calls_dir));
    let queue = app.task_queue(store, notifier, config.foreman.task_always_eager);

    match queue.enqueue(task_name, args).await?.task_id() {
        Some(id) => println!("queued {task_name} as {id}"),
        None => println!("ran {task_name} eagerly"),
    }
    Ok(())
}

fn parse_args(args: &str, kwargs: &str) -> Result<TaskArgs> {
    let args: Vec<Value> = serde_json::from_str(args).context("--args must be a JSON array")?;
    let kwargs: Map<String, Value> =
        serde_json::from_str(kwargs).context("--kwargs must be a JSON object")?;
    Ok(TaskArgs::new(args, kwargs))
}

fn seconds(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"))
}

async fn stats(config: &SluiceConfig, minutes: u32) -> Result<()> {
    let store = task_store(config)?;
    let window = Duration::from_secs(u64::from(minutes) * 60);
    let since = chrono::Utc::now() - chrono::TimeDelta::minutes(i64::from(minutes));
    let summaries = store.summary(since).await?;

    if summaries.is_empty() {
        println!("no stats in the last {minutes} minutes");
        return Ok(());
    }
    println!(
        "{:<40} {:>8} {:>6} {:>9} {:>9} {:>9} {:>9} {:>8} {:>7}",
        "task", "done", "errors", "avg_wall", "max_wall", "avg_wait", "max_write", "backlog", "per_s"
    );
    for s in summaries {
        println!(
            "{:<40} {:>8} {:>6} {:>9} {:>9} {:>9} {:>9} {:>8} {:>7.3}",
            s.task_name,
            s.done,
            s.errors,
            seconds(s.avg_wall_time()),
            seconds(Some(s.max_wall_time)),
            seconds(s.avg_wait_time()),
            seconds(Some(s.max_write_time)),
            s.max_task_count.map_or_else(|| "?".to_string(), |n| n.to_string()),
            s.per_second(window),
        );
    }
    Ok(())
}

async fn evict(config: &SluiceConfig, project: u64, max_event_count: u64, epoch: Option<i64>) -> Result<()> {
    let engine = event_engine(config)?;
    let epoch = epoch.unwrap_or_else(|| epoch_for(chrono::Utc::now(), config.retention.epoch_seconds));
    let mut quota = ProjectQuota::new(ProjectId::new(project), max_event_count);

    let guard = tokio::task::spawn_blocking(move || quota.enforce(&engine, epoch))
        .await
        .context("eviction thread")??;
    match guard {
        Some(threshold) => println!("project {project}: evicted, max total irrelevance is now {threshold}"),
        None => println!("project {project}: within quota, nothing evicted"),
    }
    Ok(())
}

fn simulate(config: &SluiceConfig, seed: u64, epochs: u32, inflow: u64, max_size: u64) -> Result<()> {
    let mut sim = Simulator::new(seed, max_size, EvictionPolicy::from(&config.retention));
    for _ in 0..epochs {
        let report = sim.step(inflow)?;
        println!(
            "epoch {}: {} -> {} events, guard {:?}",
            report.epoch, report.stored_before, report.stored_after, report.guard
        );
    }
    print!("{}", sim.render());
    Ok(())
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = SluiceConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Run => run(config).await,
        Command::Enqueue {
            task_name,
            args,
            kwargs,
        } => enqueue(&config, &task_name, parse_args(&args, &kwargs)?).await,
        Command::Check => enqueue(&config, example_tasks::FAST_TASK, TaskArgs::default()).await,
        Command::Stats { minutes } => stats(&config, minutes).await,
        Command::Evict {
            project,
            max_event_count,
            epoch,
        } => evict(&config, project, max_event_count, epoch).await,
        Command::Simulate {
            seed,
            epochs,
            inflow,
            max_size,
        } => simulate(&config, seed, epochs, inflow, max_size),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    debug!(code, "exiting");
    // 見捨てたワーカーがプロセスを生かし続けないように
    std::process::exit(code);
}
