// Parse and checksum MRZ lines read from a file or stdin

use clap::Parser;
use idscan::{models::split_lines, validation::MrzValidator, Response};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "mrz_check")]
#[command(about = "Validate the machine readable zone of a travel document", long_about = None)]
struct Cli {
    /// File holding the MRZ lines, stdin when omitted
    input: Option<PathBuf>,
}

fn run(cli: &Cli) -> idscan::Result<String> {
    let text = match &cli.input {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let lines = MrzValidator::find_lines(&split_lines(&text));
    let record = MrzValidator::parse(&lines)?;
    for issue in MrzValidator::issues(&record) {
        eprintln!("  - {}", issue.message);
    }
    Ok(serde_json::to_string_pretty(&record)?)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(err) => {
            if let Ok(json) = serde_json::to_string(&Response::error(err.to_string())) {
                println!("{}", json);
            }
            ExitCode::FAILURE
        }
    }
}
