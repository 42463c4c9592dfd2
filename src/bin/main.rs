use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use backjob::{
    cli::{Commands, LogLevelArg, parse_args},
    config::{DaemonContext, DaemonContextBuilder, JobFile, JobMode, load_job_file},
    constants::SLEEP_SLICE,
    daemon::{DaemonProcess, Daemonizer, Detach},
    job::ShellJob,
    pidfile::{self, PidStatus},
    supervisor::{ForkSpawner, Supervisor},
    worker::WorkerLoop,
};

/// Exit status of `status` when the recorded process is gone.
const STATUS_STALE: u8 = 1;
/// Exit status of `status` when there is no PID file.
const STATUS_NOT_RUNNING: u8 = 3;

/// Options of `backjob run` after clap parsing.
struct RunRequest {
    config: Option<String>,
    name: Option<String>,
    loop_forever: bool,
    workers: Option<usize>,
    foreground: bool,
    sleep_interval: Option<f64>,
    poll_interval: Option<f64>,
    pid_file: Option<String>,
    log_file: Option<String>,
    command: Vec<String>,
}

fn main() -> ExitCode {
    let args = parse_args();
    let log_level = args.log_level;

    let result = match args.command {
        Commands::Run {
            config,
            name,
            loop_forever,
            workers,
            foreground,
            sleep_interval,
            poll_interval,
            pid_file,
            log_file,
            command,
        } => run_job(
            RunRequest {
                config,
                name,
                loop_forever,
                workers,
                foreground,
                sleep_interval,
                poll_interval,
                pid_file,
                log_file,
                command,
            },
            log_level,
        ),
        Commands::Status {
            config,
            name,
            pid_file,
            json,
        } => {
            init_logging(log_level);
            show_status(config.as_deref(), name, pid_file, json)
        }
        Commands::Stop {
            config,
            name,
            pid_file,
            timeout,
        } => {
            init_logging(log_level);
            stop_job(config.as_deref(), name, pid_file, timeout)
        }
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("backjob: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: Option<LogLevelArg>) {
    let filter = if let Some(level) = level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_job(
    request: RunRequest,
    log_level: Option<LogLevelArg>,
) -> Result<ExitCode, Box<dyn Error>> {
    let job = load_job(request.config.as_deref())?;

    let mut builder = context_builder(job.as_ref(), request.name)?;
    if let Some(path) = request.pid_file {
        builder = builder.pid_file(path);
    }
    if let Some(path) = request.log_file {
        builder = builder.log_file(path);
    }
    if let Some(level) = log_level {
        builder = builder.log_level(level.level());
    }
    if let Some(secs) = request.sleep_interval {
        builder = builder.sleep_interval(seconds("--sleep-interval", secs)?);
    }
    let context = builder.build()?;

    let command = if request.command.is_empty() {
        job.as_ref()
            .map(|job| job.command.clone())
            .ok_or("a command is required (after `--` or in the job file)")?
    } else {
        request.command.join(" ")
    };

    let mode = if request.loop_forever {
        JobMode::Loop
    } else {
        job.as_ref().map(|job| job.mode).unwrap_or_default()
    };

    let workers = request.workers.or(job.as_ref().and_then(|job| job.workers));
    if workers == Some(0) {
        return Err("--workers must be at least 1".into());
    }

    let poll_interval = request
        .poll_interval
        .map(|secs| seconds("--poll-interval", secs))
        .transpose()?;

    let detach = if request.foreground {
        Detach::Foreground
    } else {
        Detach::Background
    };

    let daemon = Daemonizer::new(context).detach(detach).start()?;
    info!("Running `{command}` in {} mode", mode.as_ref());
    let healthy = match workers {
        Some(count) => run_pool(&daemon, &command, mode, count, poll_interval),
        None => run_single(&daemon, &command, mode),
    };
    daemon.exit();

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_single(daemon: &DaemonProcess, command: &str, mode: JobMode) -> bool {
    let job = ShellJob::new(command, daemon.shutdown_flag());
    let mut worker = WorkerLoop::new(daemon);

    match mode {
        JobMode::Once => !worker.perform(|| job.run()).is_fault(),
        JobMode::Loop => {
            let summary = worker.perform_forever(|| job.run());
            info!(
                "{} stopped after {} runs ({} failed)",
                daemon.context().name(),
                summary.iterations,
                summary.faults
            );
            true
        }
    }
}

fn run_pool(
    daemon: &DaemonProcess,
    command: &str,
    mode: JobMode,
    count: usize,
    poll_interval: Option<Duration>,
) -> bool {
    let shutdown = daemon.shutdown_flag();
    let sleep_interval = daemon.context().sleep_interval();
    let command = command.to_string();

    // Workers keep the daemon's SIGINT/SIGTERM flag so a forwarded signal stops
    // the running command before the worker exits.
    let spawner = ForkSpawner::new(move |slot| {
        let job = ShellJob::new(command.as_str(), shutdown.clone()).slot(slot);
        let mut worker = WorkerLoop::with_parts(sleep_interval, shutdown.clone());
        match mode {
            JobMode::Once => {
                worker.perform(|| job.run());
            }
            JobMode::Loop => {
                worker.perform_forever(|| job.run());
            }
        }
    })
    .inherit_signal_handlers(true);

    // The master watches the daemon's flag, which has been armed since startup,
    // so a SIGTERM that arrives while the pool is forking is not lost.
    let mut supervisor = match Supervisor::new(count, spawner) {
        Ok(supervisor) => supervisor.signals(daemon.shutdown_flag().watch()),
        Err(err) => {
            error!("{err}");
            return false;
        }
    };
    if let Some(interval) = poll_interval {
        supervisor = supervisor.poll_interval(interval);
    }

    match supervisor.run() {
        Ok(()) => true,
        Err(err) => {
            error!("Supervisor failed: {err}");
            false
        }
    }
}

fn show_status(
    config: Option<&str>,
    name: Option<String>,
    pid_file: Option<String>,
    as_json: bool,
) -> Result<ExitCode, Box<dyn Error>> {
    let (label, path) = resolve_pid_file(config, name, pid_file)?;
    let status = pidfile::probe(&path)?;

    if as_json {
        let report = json!({
            "name": label,
            "pid_file": path,
            "status": status,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        match status {
            PidStatus::Running(pid) => println!("{label} is running (pid {pid})"),
            PidStatus::Stale(pid) => {
                println!("{label} is not running (stale PID file for pid {pid})")
            }
            PidStatus::Absent => println!("{label} is not running"),
        }
    }

    Ok(match status {
        PidStatus::Running(_) => ExitCode::SUCCESS,
        PidStatus::Stale(_) => ExitCode::from(STATUS_STALE),
        PidStatus::Absent => ExitCode::from(STATUS_NOT_RUNNING),
    })
}

fn stop_job(
    config: Option<&str>,
    name: Option<String>,
    pid_file: Option<String>,
    timeout: f64,
) -> Result<ExitCode, Box<dyn Error>> {
    let (label, path) = resolve_pid_file(config, name, pid_file)?;
    let timeout = seconds("--timeout", timeout)?;

    let pid = match pidfile::probe(&path)? {
        PidStatus::Absent => {
            println!("{label} is not running");
            return Ok(ExitCode::SUCCESS);
        }
        PidStatus::Stale(pid) => {
            warn!("Removing stale PID file {} for pid {pid}", path.display());
            fs::remove_file(&path)?;
            println!("{label} is not running (removed stale PID file)");
            return Ok(ExitCode::SUCCESS);
        }
        PidStatus::Running(pid) => Pid::from_raw(pid),
    };

    info!("Sending SIGTERM to {label} (pid {pid})");
    match signal::kill(pid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => return Err(format!("failed to signal pid {pid}: {err}").into()),
    }

    let deadline = Instant::now() + timeout;
    while path.exists() && signal::kill(pid, None).is_ok() {
        if Instant::now() >= deadline {
            return Err(format!(
                "{label} (pid {pid}) did not stop within {}s",
                timeout.as_secs_f64()
            )
            .into());
        }
        thread::sleep(SLEEP_SLICE);
    }

    println!("Stopped {label} (pid {pid})");
    Ok(ExitCode::SUCCESS)
}

fn load_job(config: Option<&str>) -> Result<Option<JobFile>, Box<dyn Error>> {
    Ok(config
        .map(|path| load_job_file(Path::new(path)))
        .transpose()?)
}

fn context_builder(
    job: Option<&JobFile>,
    name: Option<String>,
) -> Result<DaemonContextBuilder, Box<dyn Error>> {
    let name = name
        .or_else(|| job.map(|job| job.name.clone()))
        .ok_or("a job name is required (--name or --config)")?;

    let mut builder = DaemonContext::builder(name);
    if let Some(job) = job {
        builder = builder.job_file(job)?;
    }
    Ok(builder)
}

fn resolve_pid_file(
    config: Option<&str>,
    name: Option<String>,
    pid_file: Option<String>,
) -> Result<(String, PathBuf), Box<dyn Error>> {
    if let Some(path) = pid_file {
        let label = name.unwrap_or_else(|| path.clone());
        return Ok((label, PathBuf::from(path)));
    }

    let job = load_job(config)?;
    let context = context_builder(job.as_ref(), name)?.build()?;
    Ok((context.name().to_string(), context.pid_file().to_path_buf()))
}

fn seconds(flag: &str, secs: f64) -> Result<Duration, Box<dyn Error>> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| format!("{flag} must be a non-negative number of seconds").into())
}
