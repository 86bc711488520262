use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;
mod output;
mod topology;

/// fleetlab - distributed testbed orchestration
#[derive(Parser)]
#[command(name = "fleet")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Model to bind from the registry
  #[arg(long, global = true, default_value = "demo")]
  model: String,

  /// Variable override applied before binding (repeatable)
  #[arg(long = "set", global = true, value_name = "PATH=VALUE")]
  set: Vec<String>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Provision infrastructure and build out a new run
  Up,

  /// Execute the operating stages of the current run
  Run,

  /// Stop components and tear down infrastructure
  Dispose {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    force: bool,
  },

  /// List runs under the fleetlab home
  Status {
    /// Show host addresses of the current run
    #[arg(short, long)]
    verbose: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,
  },

  /// Invoke the model's bootstrap workflow on the current run
  Bootstrap,

  /// Start every component (the model's start workflow)
  Start,

  /// Stop every component (the model's stop workflow)
  Stop,

  /// Sample metrics into host data (the model's metrics workflow)
  Metrics,

  /// Open an interactive shell on the model's console host
  Console,

  /// Write a report of accumulated host data into the run directory
  Report,
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .without_time()
    .init();

  let cli = Cli::parse();

  let result = match cli.command {
    Commands::Up => cmd::cmd_up(&cli.model, &cli.set),
    Commands::Run => cmd::cmd_run(&cli.model, &cli.set),
    Commands::Dispose { force } => cmd::cmd_dispose(&cli.model, &cli.set, force),
    Commands::Status { verbose, json } => cmd::cmd_status(verbose, json),
    Commands::Bootstrap => cmd::cmd_action(&cli.model, &cli.set, "bootstrap"),
    Commands::Start => cmd::cmd_action(&cli.model, &cli.set, "start"),
    Commands::Stop => cmd::cmd_action(&cli.model, &cli.set, "stop"),
    Commands::Metrics => cmd::cmd_action(&cli.model, &cli.set, "metrics"),
    Commands::Console => cmd::cmd_action(&cli.model, &cli.set, "console"),
    Commands::Report => cmd::cmd_action(&cli.model, &cli.set, "report"),
  };

  if let Err(err) = result {
    output::print_error(&format!("{:#}", err));
    std::process::exit(1);
  }
}
