//! Operator CLI for the subagent pool. Each subcommand starts a pool
//! against the given config, performs one action, and tears it down —
//! there is no resident daemon here; a long-running host process embeds
//! [`subagent_pool::Pool`] directly instead of shelling out to this binary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use subagent_pool::{ContainerAdapter, FakeAdapter, Pool, PoolConfig};
use subagent_protocol::{Request, RequestType};

#[derive(Parser, Debug)]
#[command(name = "subagent-cli", about = "Operate a sandboxed subagent container pool")]
struct Args {
    /// Path to a TOML config file layered over defaults (env `SUBAGENT_*`
    /// overrides both, per spec §3).
    #[arg(long)]
    config: Option<String>,

    /// Path to a `subagent-worker`-compatible binary used when the
    /// `docker` feature is not compiled in. Ignored under `--docker`.
    #[arg(long, default_value = "subagent-worker")]
    worker_binary: String,

    /// Use the real Docker adapter instead of the local-process stand-in.
    /// Requires this binary to be built with the `docker` feature.
    #[arg(long)]
    docker: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the pool, send a liveness ping through one worker, print the result.
    Ping,

    /// Start the pool, run one task end to end, print the JSON response.
    RunTask {
        task: String,

        #[arg(long, default_value_t = 0)]
        timeout_s: u64,

        /// Repeatable `NAME=VALUE` secret, filtered to the task's allow-list.
        #[arg(long = "secret")]
        secrets: Vec<String>,
    },

    /// Start the pool, run one health-check pass, print per-worker results.
    Health,

    /// Start the pool, print its metrics snapshot (mostly useful after
    /// `run-task` calls accumulate in a long-lived embedding, not this
    /// one-shot CLI).
    Metrics,

    /// Start the pool and immediately drain it, exercising graceful shutdown.
    Drain {
        #[arg(long, default_value_t = 10)]
        drain_timeout_s: u64,

        #[arg(long, default_value_t = 10)]
        shutdown_timeout_s: u64,
    },
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn parse_secrets(pairs: &[String]) -> HashMap<String, String> {
    pairs
        .iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::main]
async fn main() {
    init_logging();
    let args = Args::parse();

    let config = match PoolConfig::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let adapter = build_adapter(&args);

    let pool = match Pool::start(config, adapter).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("failed to start pool: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = match args.command {
        Command::Ping => run_ping(&pool).await,
        Command::RunTask { task, timeout_s, secrets } => {
            run_task(&pool, task, timeout_s, parse_secrets(&secrets)).await
        }
        Command::Health => run_health(&pool).await,
        Command::Metrics => run_metrics(&pool),
        Command::Drain { drain_timeout_s, shutdown_timeout_s } => {
            pool.graceful_shutdown(
                Duration::from_secs(drain_timeout_s),
                Duration::from_secs(shutdown_timeout_s),
            )
            .await;
            println!("{{\"status\":\"drained\"}}");
            return;
        }
    };

    pool.graceful_shutdown(Duration::from_secs(5), Duration::from_secs(10)).await;
    std::process::exit(exit_code);
}

#[cfg(feature = "docker")]
fn build_adapter(args: &Args) -> Arc<dyn ContainerAdapter> {
    if args.docker {
        match subagent_pool::DockerAdapter::connect() {
            Ok(adapter) => return Arc::new(adapter),
            Err(e) => {
                eprintln!("failed to connect to Docker: {e}");
                std::process::exit(1);
            }
        }
    }
    Arc::new(FakeAdapter::new(args.worker_binary.clone()))
}

#[cfg(not(feature = "docker"))]
fn build_adapter(args: &Args) -> Arc<dyn ContainerAdapter> {
    if args.docker {
        eprintln!("this binary was built without the `docker` feature");
        std::process::exit(1);
    }
    Arc::new(FakeAdapter::new(args.worker_binary.clone()))
}

async fn run_ping(pool: &Pool) -> i32 {
    let request = Request::ping("cli-ping");
    match subagent_pool::execute_task(pool, request, HashMap::new(), None).await {
        Ok(response) => {
            println!("{}", serde_json::to_string(&response).expect("Response serializes"));
            0
        }
        Err(e) => {
            eprintln!("ping failed: {e}");
            1
        }
    }
}

async fn run_task(pool: &Pool, task: String, timeout_s: u64, secrets: HashMap<String, String>) -> i32 {
    let llm_api_key = pool
        .config()
        .llm_api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok());

    let request = Request {
        version: subagent_protocol::PROTOCOL_VERSION.to_string(),
        id: format!("cli-{}", std::process::id()),
        correlation_id: String::new(),
        request_type: RequestType::Execute,
        task,
        timeout_s,
        deadline_unix: None,
        secrets: HashMap::new(),
        llm_api_key: None,
    };

    match subagent_pool::execute_task(pool, request, secrets, llm_api_key).await {
        Ok(response) => {
            println!("{}", serde_json::to_string(&response).expect("Response serializes"));
            0
        }
        Err(e) => {
            eprintln!("task failed: {e}");
            1
        }
    }
}

async fn run_health(pool: &Pool) -> i32 {
    let statuses = pool.health_check().await;
    pool.recreate_unhealthy(&statuses).await;
    let json: Vec<_> = statuses
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "healthy": s.healthy,
                "oom_killed": s.oom_killed,
                "error": s.error,
            })
        })
        .collect();
    println!("{}", serde_json::to_string(&json).expect("health statuses serialize"));
    0
}

fn run_metrics(pool: &Pool) -> i32 {
    let metrics = pool.metrics();
    println!(
        "{}",
        serde_json::to_string(&serde_json::json!({
            "tasks_completed": metrics.tasks_completed,
            "tasks_failed": metrics.tasks_failed,
            "tasks_timed_out": metrics.tasks_timed_out,
            "queue_full_hits": metrics.queue_full_hits,
            "recreations": metrics.recreations,
            "oom_kills": metrics.oom_kills,
        }))
        .expect("metrics serialize")
    );
    0
}
