// Identity document extraction from the command line

use clap::Parser;
use idscan::{
    models::{FieldSource, ValidationIssueType},
    processing::BackendKind,
    Config, DocumentExtractor, DocumentType, ExtractionResult, Response,
};
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "idscan")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Extract identity document fields from an image", long_about = None)]
struct Cli {
    /// Image of the document (JPEG, PNG, BMP, ...)
    image: PathBuf,

    /// national_id (ktp) or passport
    #[arg(long = "doc-type", default_value = "national_id")]
    doc_type: DocumentType,

    /// local, cloud_vision or llm; defaults to the configured backend
    #[arg(long)]
    backend: Option<BackendKind>,

    /// TOML configuration, `config/idscan.toml` when present
    #[arg(long)]
    config: Option<PathBuf>,

    /// Language hint such as eng+ind
    #[arg(long)]
    lang: Option<String>,

    /// Pretty-print the JSON envelope
    #[arg(long)]
    pretty: bool,

    /// Print a readable report instead of JSON
    #[arg(long, conflicts_with = "pretty")]
    report: bool,
}

fn run(cli: &Cli) -> idscan::Result<ExtractionResult> {
    let config = Config::load_or_default(cli.config.as_deref())?;
    let mut extractor = DocumentExtractor::from_config(&config, cli.backend)?;
    if let Some(lang) = &cli.lang {
        extractor = extractor.with_language(lang);
    }
    let bytes = std::fs::read(&cli.image)?;
    extractor.extract_bytes(bytes, cli.doc_type)
}

fn print_json(response: &Response, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(response)
    } else {
        serde_json::to_string(response)
    };
    match rendered {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize response: {}", e),
    }
}

fn print_report(result: &ExtractionResult) {
    println!("\n===============================================");
    println!("      {} EXTRACTION REPORT", result.document_type.as_str().to_uppercase());
    println!("===============================================\n");

    println!("FIELDS:");
    for field in result.fields.values() {
        let source = match field.source {
            FieldSource::Label => "label",
            FieldSource::Heuristic => "heuristic",
            FieldSource::Structured => "structured",
            FieldSource::Mrz => "mrz",
            FieldSource::None => "-",
        };
        println!("  {:<16} {:<32} [{}]", field.name, field.value, source);
    }

    if let Some(mrz) = &result.mrz {
        println!("\nMRZ ({:?}):", mrz.format);
        for line in &mrz.raw_lines {
            println!("  {}", line);
        }
        println!("  Checksums: {}", if mrz.mrz_valid { "PASSED" } else { "FAILED" });
    }

    if !result.issues.is_empty() {
        println!("\nISSUES FOUND:");
        for issue in &result.issues {
            let kind = match issue.issue_type {
                ValidationIssueType::FieldNotFound => "FIELD",
                ValidationIssueType::ChecksumMismatch => "CHECKSUM",
                ValidationIssueType::MrzUnreadable => "MRZ",
                ValidationIssueType::EmptyRecognition => "OCR",
            };
            println!("  - [{}] {}", kind, issue.message);
        }
    }

    println!(
        "\nDocument extraction result: {}",
        if result.valid { "VALID" } else { "INVALID" }
    );
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(result) => {
            if cli.report {
                print_report(&result);
            } else {
                print_json(&result.to_response(), cli.pretty);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("Extraction of {:?} failed: {}", cli.image, err);
            print_json(&Response::error(err.to_string()), cli.pretty);
            ExitCode::FAILURE
        }
    }
}
