mod handler;
mod logging;
mod spool;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use forkpool::{
    ConsumerRegistry, ExecSpawner, INTERNAL_WORKER_FLAG, Orchestrator, OrchestratorConfig,
    PoolConfig, VersionInfo, WorkerSettings, run_worker,
};

use handler::{CommandHandler, LogHandler};
use spool::FsSpool;

const USAGE: &str = "\
Usage:
  forkpool run --spool <dir> --queue <name> [options] [--exec <program> [args...]]
  forkpool enqueue --spool <dir> --queue <name> <payload>
  forkpool --version

Run options:
  --workers <n>              Worker processes [default: CPU count, or FORKPOOL_WORKERS]
  --timeout <secs>           Per-unit deadline, 0 for none [default: 0]
  --max-memory <bytes>       Retire a worker above this RSS [default: off]
  --memory-check-cycle <n>   Sample RSS every n units [default: 16]
  --max-requests <n>         Retire a worker after n dispatches [default: off]
  --exec <program> [args]    Run program per unit with the payload on stdin;
                             must come last [default: log the payload]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RunArgs {
    spool: PathBuf,
    queue: String,
    workers: Option<usize>,
    timeout_secs: u64,
    max_memory: Option<u64>,
    memory_check_cycle: Option<u32>,
    max_requests: Option<u64>,
    exec: Option<Vec<String>>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run(RunArgs),
    Worker(RunArgs),
    Enqueue {
        spool: PathBuf,
        queue: String,
        payload: String,
    },
    Version,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    let code = match command {
        Command::Version => {
            let info = VersionInfo::new();
            println!("forkpool {} (protocol {})", info.forkpool, info.protocol);
            0
        }
        Command::Enqueue {
            spool,
            queue,
            payload,
        } => match enqueue(&spool, &queue, payload) {
            Ok(id) => {
                println!("{id}");
                0
            }
            Err(e) => {
                eprintln!("error: {e:#}");
                1
            }
        },
        Command::Run(run) => {
            let log_file = logging::init_tracing();
            match run_master(&args, run, log_file) {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %format!("{:#}", e), "forkpool failed");
                    1
                }
            }
        }
        Command::Worker(run) => {
            logging::init_tracing();
            if let Err(e) = run_worker_process(run) {
                tracing::error!(error = %format!("{:#}", e), "Worker failed");
            }
            // Planned or not, a worker leaving is a success; the master respawns.
            0
        }
    };
    process::exit(code);
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut rest = args.get(1..).unwrap_or_default();
    let worker = rest.first().map(String::as_str) == Some(INTERNAL_WORKER_FLAG);
    if worker {
        rest = &rest[1..];
    }

    match rest.first().map(String::as_str) {
        Some("run") => {
            let run = parse_run(&rest[1..])?;
            Ok(if worker {
                Command::Worker(run)
            } else {
                Command::Run(run)
            })
        }
        Some("enqueue") if !worker => parse_enqueue(&rest[1..]),
        Some("--version") | Some("-V") if !worker => Ok(Command::Version),
        Some("--help") | Some("-h") => Err(String::new()),
        Some(other) => Err(format!("unknown command: {other}")),
        None => Err("missing command".to_string()),
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn number<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, String> {
    let raw = value(args, i, flag)?;
    raw.parse()
        .map_err(|_| format!("{flag} expects a number, got '{raw}'"))
}

fn parse_run(args: &[String]) -> Result<RunArgs, String> {
    let mut run = RunArgs::default();
    let mut spool = None;
    let mut queue = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--spool" => {
                i += 1;
                spool = Some(PathBuf::from(value(args, i, "--spool")?));
            }
            "--queue" => {
                i += 1;
                queue = Some(value(args, i, "--queue")?.to_string());
            }
            "--workers" => {
                i += 1;
                run.workers = Some(number(args, i, "--workers")?);
            }
            "--timeout" => {
                i += 1;
                run.timeout_secs = number(args, i, "--timeout")?;
            }
            "--max-memory" => {
                i += 1;
                run.max_memory = Some(number(args, i, "--max-memory")?);
            }
            "--memory-check-cycle" => {
                i += 1;
                run.memory_check_cycle = Some(number(args, i, "--memory-check-cycle")?);
            }
            "--max-requests" => {
                i += 1;
                run.max_requests = Some(number(args, i, "--max-requests")?);
            }
            "--exec" => {
                let command = args[i + 1..].to_vec();
                if command.is_empty() {
                    return Err("--exec requires a program".to_string());
                }
                run.exec = Some(command);
                break;
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    run.spool = spool.ok_or("missing required option: --spool")?;
    run.queue = queue.ok_or("missing required option: --queue")?;
    if run.workers == Some(0) {
        return Err("--workers must be at least 1".to_string());
    }
    Ok(run)
}

fn parse_enqueue(args: &[String]) -> Result<Command, String> {
    let mut spool = None;
    let mut queue = None;
    let mut payload = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--spool" => {
                i += 1;
                spool = Some(PathBuf::from(value(args, i, "--spool")?));
            }
            "--queue" => {
                i += 1;
                queue = Some(value(args, i, "--queue")?.to_string());
            }
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => {
                if payload.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                payload = Some(arg.to_string());
            }
        }
        i += 1;
    }

    Ok(Command::Enqueue {
        spool: spool.ok_or("missing required option: --spool")?,
        queue: queue.ok_or("missing required option: --queue")?,
        payload: payload.ok_or("missing required argument: <payload>")?,
    })
}

fn enqueue(spool: &std::path::Path, queue: &str, payload: String) -> anyhow::Result<String> {
    let spool = FsSpool::open(spool, queue)
        .with_context(|| format!("cannot open queue '{}' in {}", queue, spool.display()))?;
    Ok(spool.enqueue(payload)?)
}

fn pool_config(run: &RunArgs) -> anyhow::Result<PoolConfig> {
    let mut config = PoolConfig::default()
        .from_env()
        .context("invalid FORKPOOL_* environment")?;
    if let Some(n) = run.workers {
        config = config.with_workers(n);
    }
    if let Some(bytes) = run.max_memory {
        config = config.with_max_memory(bytes);
    }
    if let Some(cycle) = run.memory_check_cycle {
        config = config.with_memory_check_cycle(cycle.max(1));
    }
    if let Some(n) = run.max_requests {
        config = config.with_max_requests(n);
    }
    Ok(config)
}

fn run_master(
    args: &[String],
    run: RunArgs,
    log_file: Option<logging::ReopenableFile>,
) -> anyhow::Result<()> {
    let spool = FsSpool::open(&run.spool, &run.queue)
        .with_context(|| format!("cannot open queue '{}' in {}", run.queue, run.spool.display()))?
        .with_timeout(Duration::from_secs(run.timeout_secs));
    spool
        .recover_inflight()
        .context("cannot recover in-flight units")?;

    let pool = pool_config(&run)?;
    let spawner = ExecSpawner::current_exe()
        .context("cannot locate forkpool executable")?
        .with_args(args.iter().skip(1).cloned());

    let mut config = OrchestratorConfig::new(pool).with_spawner(Arc::new(spawner));
    if let Some(log_file) = log_file {
        config = config.with_reopen_logs(move || {
            if let Err(e) = log_file.reopen() {
                eprintln!("warning: cannot reopen {}: {}", log_file.path().display(), e);
            }
        });
    }

    let version = VersionInfo::new().with_handler(handler_name(&run));
    tracing::info!(
        version = version.forkpool,
        protocol = version.protocol,
        handler = ?version.handler,
        queue = %run.queue,
        "Starting forkpool"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("forkpool-master")
        .build()
        .context("cannot build tokio runtime")?;

    runtime.block_on(async move {
        let handle = Orchestrator::start(config, Arc::new(spool)).await?;
        handle.join().await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn handler_name(run: &RunArgs) -> &'static str {
    if run.exec.is_some() { "command" } else { "log" }
}

fn run_worker_process(run: RunArgs) -> anyhow::Result<()> {
    let settings = WorkerSettings::from_env().context("missing worker settings")?;
    let spool = FsSpool::open(&run.spool, &run.queue)
        .with_context(|| format!("cannot open queue '{}'", run.queue))?;
    let registry = ConsumerRegistry::new().with_consumer(run.queue.clone(), Arc::new(spool));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot build tokio runtime")?;

    let exit = runtime.block_on(async move {
        match run.exec.as_deref().and_then(<[String]>::split_first) {
            Some((program, args)) => {
                let handler = CommandHandler::new(program.clone(), args.to_vec());
                run_worker(Arc::new(handler), registry, settings).await
            }
            None => run_worker(Arc::new(LogHandler), registry, settings).await,
        }
    })?;
    tracing::debug!(?exit, "Worker finished");
    Ok(())
}
