mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, GlobalOpts, LogFormat};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose, cli.global.log_format);

    if let Err(err) = run(cli.command, &cli.global).await {
        let code = err.exit_code();
        let envelope = output::render_single(cli.global.output, &err.envelope(), |e| {
            serde_json::to_string_pretty(e).unwrap_or_default()
        });
        output::print_output(&envelope, cli.global.quiet);
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(command: Command, global: &GlobalOpts) -> Result<(), CliError> {
    match command {
        Command::Apply(args) => commands::apply::handle(args, global).await,
        Command::Resources(args) => commands::resources::handle(args, global),
        Command::Config(args) => commands::config_cmd::handle(args, global),
        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "ontapctl", &mut std::io::stdout());
            Ok(())
        }
    }
}
