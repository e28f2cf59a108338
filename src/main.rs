//! vshell: boot a QEMU Linux VM and drive its serial console from the
//! terminal, or inspect the launch plan and preferences it would use.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use vshell::config::Preferences;
use vshell::paths::VShellPaths;
use vshell::session::Session;
use vshell::vm::{
    ArgBuilder, ControllerOptions, LaunchLayout, LifecycleController, MemoryProbe, PortMap,
    ProcMeminfo, ResourceBudget, Service, SessionObserver, locate_qemu,
};

/// QEMU Linux VM launcher with a serial console
#[derive(Parser, Debug)]
#[command(name = "vshell", version, about = "QEMU Linux VM launcher with a serial console")]
struct Args {
    /// Log at info level when RUST_LOG is unset
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot the VM and attach this terminal to its serial console
    Run {
        /// Keep the status registration after an unexpected VM exit
        #[arg(long)]
        debug: bool,
    },
    /// Print the QEMU command line and environment that `run` would use
    Plan {
        #[arg(long, value_enum, default_value_t = PlanFormat::Table)]
        format: PlanFormat,
    },
    /// Print the host memory snapshot and the resulting VM budget
    Budget,
    /// Show or change preferences
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the SSH URI for the configured user and forwarded port
    SshUri,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    /// Set the host port for ssh, p5678, p5700, p6379 or p9000
    SetPort { service: String, port: i32 },
    /// Set the default SSH user
    SetUser { name: String },
    /// Suppress the terminal bell
    IgnoreBell {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    ToggleExtraKeys,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PlanFormat {
    Table,
    Json,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let Some(paths) = VShellPaths::resolve() else {
        eprintln!("vshell: HOME is not set");
        return ExitCode::FAILURE;
    };
    // Dropped on return, after the last event is logged.
    let _log_guard = vshell::logging::init(Some(&paths.logs), args.verbose);

    match dispatch(args, &paths) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            eprintln!("vshell: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(args: Args, paths: &VShellPaths) -> Result<()> {
    match args.command {
        Command::Run { debug } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to create tokio runtime")?;
            runtime.block_on(run_vm(paths, debug))
        }
        Command::Plan { format } => print_plan(paths, format),
        Command::Budget => print_budget(),
        Command::Config { action } => configure(paths, action),
        Command::SshUri => {
            let prefs = Preferences::open(paths.preferences_file())?;
            let ports = PortMap::resolve(prefs.values())?;
            println!("{}", ports.ssh_uri(prefs.default_ssh_user()));
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn run_vm(paths: &VShellPaths, debug: bool) -> Result<()> {
    paths.ensure().context("failed to create application directories")?;
    let mut prefs = Preferences::open(paths.preferences_file())?;
    let first_run = prefs.is_first_run();

    let mut options = ControllerOptions::new(layout(paths)?);
    options.debug = debug;
    let mut controller = LifecycleController::new(options, prefs.clone());
    controller.attach_observer(Box::new(ConsoleObserver::default()));

    controller.start().context("failed to start virtual machine")?;
    if first_run {
        prefs.complete_first_run()?;
    }
    if let Some(uri) = controller.ssh_uri() {
        info!(%uri, "SSH available");
    }

    let handle = controller.handle();
    let stdin_handle = handle.clone();
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_handle.write(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping VM");
            let _ = handle.stop();
        }
    });

    controller.run().await;
    Ok(())
}

/// Mirrors the guest console onto this terminal.
#[derive(Default)]
struct ConsoleObserver {
    shown: String,
}

impl SessionObserver for ConsoleObserver {
    fn on_text_changed(&mut self, session: &Session) {
        let transcript = session.screen_transcript();
        let mut out = std::io::stdout().lock();
        match transcript.strip_prefix(self.shown.as_str()) {
            Some(tail) => {
                let _ = out.write_all(tail.as_bytes());
            }
            None => {
                let _ = write!(out, "\x1b[2J\x1b[H{transcript}");
            }
        }
        let _ = out.flush();
        self.shown = transcript;
    }

    fn on_session_finished(&mut self, session: &Session) {
        match session.exit_status() {
            Some(status) => eprintln!("\r\n[virtual machine exited: {status}]"),
            None => eprintln!("\r\n[virtual machine exited]"),
        }
    }

    fn on_clipboard_text(&mut self, _session: &Session, text: &str) {
        info!(bytes = text.len(), "guest set clipboard");
    }

    fn on_bell(&mut self, _session: &Session) {
        let _ = std::io::stderr().write_all(b"\x07");
    }
}

// ---------------------------------------------------------------------------
// plan / budget / config
// ---------------------------------------------------------------------------

fn print_plan(paths: &VShellPaths, format: PlanFormat) -> Result<()> {
    let prefs = Preferences::open(paths.preferences_file())?;
    let ports = PortMap::resolve(prefs.values())?;
    let budget = ResourceBudget::from_probe(&ProcMeminfo::default(), &Default::default());
    let layout = layout(paths)?;
    let inherited: BTreeMap<String, String> = std::env::vars().collect();

    let plan = ArgBuilder::new(&layout).build(
        &budget,
        &ports,
        layout.host_share_available(),
        &inherited,
    )?;

    match format {
        PlanFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        PlanFormat::Table => {
            println!("program: {}", plan.program.display());
            println!("cwd:     {}", plan.cwd.display());
            println!("argv:");
            for arg in &plan.argv {
                println!("  {arg}");
            }
            println!("env:");
            for (name, value) in &plan.env {
                println!("  {name}={value}");
            }
        }
    }
    Ok(())
}

fn print_budget() -> Result<()> {
    let snapshot = ProcMeminfo::default()
        .snapshot()
        .context("failed to read host memory state")?;
    let budget = ResourceBudget::compute(&snapshot, &Default::default());
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "snapshot": snapshot,
        "budget": budget,
    }))?);
    Ok(())
}

fn configure(paths: &VShellPaths, action: ConfigAction) -> Result<()> {
    let mut prefs = Preferences::open(paths.preferences_file())?;
    match action {
        ConfigAction::Show => print!("{}", prefs.values().to_toml()?),
        ConfigAction::SetPort { service, port } => {
            let Some(service) = Service::from_name(&service) else {
                bail!("unknown service {service:?}; expected ssh, p5678, p5700, p6379 or p9000");
            };
            prefs.set_port(service, port)?;
            if let Err(e) = PortMap::resolve(prefs.values()) {
                warn!(error = %e, "saved, but the next launch will be rejected");
            }
        }
        ConfigAction::SetUser { name } => prefs.set_default_ssh_user(&name)?,
        ConfigAction::IgnoreBell { enabled } => prefs.set_ignore_bell(enabled)?,
        ConfigAction::ToggleExtraKeys => {
            let shown = prefs.toggle_show_extra_keys()?;
            println!("show_extra_keys = {shown}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Host layout
// ---------------------------------------------------------------------------

fn layout(paths: &VShellPaths) -> Result<LaunchLayout> {
    let mut layout = LaunchLayout::new(&paths.data, &paths.cache, find_qemu()?);
    if let Some(share) = std::env::var_os("VSHELL_HOST_SHARE") {
        layout = layout.with_host_share_root(share);
    }
    Ok(layout)
}

/// Resolve the QEMU binary: `VSHELL_QEMU`, then `PATH`.
fn find_qemu() -> Result<PathBuf> {
    if let Some(explicit) = std::env::var_os("VSHELL_QEMU") {
        let path = PathBuf::from(explicit);
        if path.is_file() {
            return Ok(path);
        }
        bail!("VSHELL_QEMU points at {}, which is not a file", path.display());
    }

    let cwd = std::env::current_dir().context("failed to read working directory")?;
    Ok(locate_qemu(std::env::var_os("PATH").as_deref(), &cwd)?)
}
