use std::process::ExitCode;

use clap::{Parser, Subcommand};

use conductor::commands::{
    CancelArgs, EscalateArgs, ListArgs, MonitorArgs, RegisterArgs, RetryArgs, ShowArgs, StatusArgs,
};
use conductor::{error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "conductor",
    version,
    about = "Orchestration core for issue-driven agent dispatch pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the background health monitor
    Monitor(MonitorArgs),
    /// Show dispatch counts by status and tier
    Status(StatusArgs),
    /// List active or completed dispatches
    List(ListArgs),
    /// Show one dispatch by id
    Show(ShowArgs),
    /// Register a new dispatch
    Register(RegisterArgs),
    /// Retry a stuck dispatch
    Retry(RetryArgs),
    /// Escalate a live dispatch to stuck
    Escalate(EscalateArgs),
    /// Cancel (remove) an active dispatch
    Cancel(CancelArgs),
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Monitor(_) => "monitor",
            Self::Status(_) => "status",
            Self::List(_) => "list",
            Self::Show(_) => "show",
            Self::Register(_) => "register",
            Self::Retry(_) => "retry",
            Self::Escalate(_) => "escalate",
            Self::Cancel(_) => "cancel",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Monitor(args) => args.execute(),
        Commands::Status(args) => args.execute(),
        Commands::List(args) => args.execute(),
        Commands::Show(args) => args.execute(),
        Commands::Register(args) => args.execute(),
        Commands::Retry(args) => args.execute(),
        Commands::Escalate(args) => args.execute(),
        Commands::Cancel(args) => args.execute(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(dispatch_err) = e.downcast_ref::<error::DispatchError>() {
                eprintln!("error: {dispatch_err}");
                dispatch_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
