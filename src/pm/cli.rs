use crate::pm::config::{self, Config, Settings};
use crate::pm::error::{keeper_error, KeeperError};
use crate::pm::instance::{Instance, StartOutcome};
use crate::pm::{build_info, logging, probe};
use clap::{Parser, ValueEnum};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "pidkeeper",
    version,
    about = "Daemonize a program, track its pid and lock files, optionally watch and restart it"
)]
pub struct Args {
    /// Optional YAML file with default directories and launch options
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Directory for the lock file
    #[arg(long = "lock-dir")]
    pub lock_dir: Option<PathBuf>,
    /// Directory for the pid files
    #[arg(long = "pid-dir")]
    pub pid_dir: Option<PathBuf>,
    /// Directory for the log file
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,

    /// Instance name used for the state files (default: program file name without extension)
    #[arg(short = 'b', long = "basename")]
    pub basename: Option<String>,

    /// Run the program as this user (through `su`)
    #[arg(short = 'u', long = "user")]
    pub user: Option<String>,

    /// Scheduling priority adjustment passed to `nice -n`
    #[arg(short = 'n', long = "nice", allow_negative_numbers = true)]
    pub nice: Option<i32>,

    /// Interpreter to run the program with, e.g. `node` or `php`
    #[arg(short = 'i', long = "interpreter")]
    pub interpreter: Option<String>,

    /// Output timestamping helper (looked up on PATH)
    #[arg(long = "timestamper", conflicts_with = "no_timestamps")]
    pub timestamper: Option<String>,

    /// Append raw output to the log without the timestamping helper
    #[arg(long = "no-timestamps")]
    pub no_timestamps: bool,

    /// Watch loop period in milliseconds
    #[arg(long = "interval-ms")]
    pub interval_ms: Option<u64>,

    /// Termination escalation base in milliseconds (waits are 1x, 10x, 30x, then 1x after SIGKILL)
    #[arg(long = "timeout-ms")]
    pub timeout_ms: Option<u64>,

    /// Report the resolved command line and per-pid liveness
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Print nothing but errors
    #[arg(short = 's', long = "silent", conflicts_with = "verbose")]
    pub silent: bool,

    /// Stop the instance instead of starting it
    #[arg(short = 'k', long = "kill", conflicts_with_all = ["restart", "status"])]
    pub kill: bool,

    /// Start: keep watching and restart on death. Kill: stop the watcher too.
    #[arg(short = 'w', long = "watch")]
    pub watch: bool,

    /// Ignore an existing lock file and adopt a running instance
    #[arg(short = 'f', long = "force")]
    pub force: bool,

    /// Stop (including the watcher) and start again
    #[arg(long = "restart", conflicts_with = "status")]
    pub restart: bool,

    /// Report whether the instance is running; exit code 1 when it is not
    #[arg(long = "status")]
    pub status: bool,

    /// Status output format
    #[arg(long = "format", default_value = "text")]
    pub format: OutputFormat,

    /// Program to daemonize
    pub program: Option<PathBuf>,

    /// Arguments passed to the program (after `--`)
    #[arg(last = true)]
    pub args: Vec<OsString>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Kill,
    Restart,
    Status,
}

impl Args {
    pub fn action(&self) -> Action {
        if self.kill {
            Action::Kill
        } else if self.restart {
            Action::Restart
        } else if self.status {
            Action::Status
        } else {
            Action::Start
        }
    }

    /// Built-in defaults, then the config file, then flags.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let mut s = match self.config.as_deref() {
            Some(p) => config::load_settings(p)?,
            None => Settings::default(),
        };
        if let Some(d) = self.lock_dir.clone() {
            s.lock_dir = d;
        }
        if let Some(d) = self.pid_dir.clone() {
            s.pid_dir = d;
        }
        if let Some(d) = self.log_dir.clone() {
            s.log_dir = d;
        }
        if let Some(u) = self.user.clone() {
            s.user = Some(u);
        }
        if let Some(n) = self.nice {
            s.nice = Some(n);
        }
        if let Some(i) = self.interpreter.clone() {
            s.interpreter = Some(i);
        }
        if let Some(t) = self.timestamper.clone() {
            s.timestamper = Some(t);
        }
        if self.no_timestamps {
            s.timestamper = None;
        }
        if let Some(ms) = self.interval_ms {
            anyhow::ensure!(ms > 0, "--interval-ms must be > 0");
            s.watch_interval_ms = ms;
        }
        if let Some(ms) = self.timeout_ms {
            anyhow::ensure!(ms > 0, "--timeout-ms must be > 0");
            s.terminate_timeout_ms = ms;
        }
        Ok(s)
    }

    pub fn build_config(&self) -> anyhow::Result<Config> {
        let settings = self
            .settings()
            .map_err(|e| KeeperError::Config(format!("{e:#}")))?;
        Config::new(
            self.program.clone().unwrap_or_default(),
            self.args.clone(),
            self.basename.clone(),
            settings,
        )
    }
}

/// Console output honouring `--silent`/`--verbose`.
struct Console {
    verbose: bool,
    silent: bool,
}

impl Console {
    fn marker(&self, m: &str) {
        if !self.silent {
            println!("{m}");
        }
    }

    fn detail(&self, line: impl AsRef<str>) {
        if self.verbose {
            println!("{}", line.as_ref());
        }
    }
}

pub fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.verbose, args.silent);
    let console = Console {
        verbose: args.verbose,
        silent: args.silent,
    };
    match run(&args, &console) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            if !args.silent || keeper_error(&e).is_none() {
                eprintln!("pidkeeper: {e:#}");
            }
            console.marker("[FAILED]");
            ExitCode::from(1)
        }
    }
}

/// Run the requested action. `Ok(false)` means a clean negative answer (status: not running).
fn run(args: &Args, console: &Console) -> anyhow::Result<bool> {
    console.detail(build_info::banner());
    let cfg = args.build_config()?;
    let probe = probe::default_probe();
    let inst = Instance::new(&cfg, probe.as_ref());
    console.detail(format!("probe={} basename={}", probe.name(), cfg.basename));

    if args.action() != Action::Status {
        // Directory failures are logged inside; the operation proceeds best-effort.
        let _ = inst.prepare();
    }

    match args.action() {
        Action::Status => {
            let report = inst.status();
            match args.format {
                OutputFormat::Text => {
                    if !args.silent {
                        println!("{}", report.render_text());
                    }
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            Ok(report.running)
        }
        Action::Kill => {
            if args.verbose {
                print_states(&inst, console);
            }
            inst.kill(args.watch)?;
            console.marker("[OK]");
            Ok(true)
        }
        Action::Restart => {
            let started = inst.restart()?;
            report_start(&inst, &started, console);
            if args.watch {
                inst.watch(&started)?;
            }
            Ok(true)
        }
        Action::Start => {
            let started = inst.start(args.force)?;
            report_start(&inst, &started, console);
            if args.watch {
                inst.watch(&started)?;
            }
            Ok(true)
        }
    }
}

fn report_start(inst: &Instance<'_>, started: &StartOutcome, console: &Console) {
    if console.verbose {
        match started {
            StartOutcome::Launched(p) => {
                if let Ok(plan) = inst.launcher().plan() {
                    console.detail(format!("command: {}", plan.command_line()));
                }
                console.detail(format!("launched pids={p}"));
            }
            StartOutcome::Adopted(p) => console.detail(format!("adopted pids={p}")),
        }
        print_states(inst, console);
    }
    console.marker("[OK]");
}

fn print_states(inst: &Instance<'_>, console: &Console) {
    for p in inst.status().pids {
        console.detail(format!("pid={} state={}", p.pid, p.state));
    }
}
