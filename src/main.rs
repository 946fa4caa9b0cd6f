use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use colored::Colorize;

use mqtt_bench::{
    bench,
    cli::{normalize_args, Cli},
};

fn main() -> ExitCode {
    pretty_env_logger::init();

    let args: Vec<_> = std::env::args_os().collect();
    if args.len() <= 1 {
        // Nothing to run without a broker and an action
        let _ = Cli::command().print_help();
        return ExitCode::SUCCESS;
    }

    let cli = Cli::parse_from(normalize_args(args));
    let json = cli.json;
    let (action, options) = match cli.validate() {
        Ok(v) => v,
        Err(e) => {
            println!("{}", e.to_string().red());
            return ExitCode::from(2);
        }
    };

    match bench::start(action, options) {
        Ok(result) if json => match serde_json::to_string_pretty(&result.summary()) {
            Ok(summary) => println!("{summary}"),
            Err(e) => {
                println!("{}", format!("Failed to serialize result: {e}").red());
                return ExitCode::FAILURE;
            }
        },
        Ok(result) => println!("\n{result}"),
        Err(e) => {
            println!("{}", e.to_string().red());
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
