//! Reasoning Spine CLI
//!
//! Run with: cargo run -- --run context.json --index records.json
//! State lives in the platform data directory (see `SpineConfig`).

use anyhow::{bail, Context, Result};
use reasoning_spine::{
    config::{default_data_dir, SpineConfig},
    learning::print_learning_stats,
    legacy::to_legacy_log,
    parse_pointer_list, CandidateRecord, InputRequirements, ReviewAction, RunContext, Spine,
};
use std::fs;
use std::path::{Path, PathBuf};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let json_output = args.iter().any(|a| a == "--json");

    match args[1].as_str() {
        "--readiness" => {
            let (Some(index_path), Some(required)) = (args.get(2), args.get(3)) else {
                bail!("Usage: spine --readiness <records.json> <required-pointers> [--optional <pointers>] [--json]");
            };
            let optional = flag_value(&args, "--optional");
            run_readiness(Path::new(index_path), required, optional, json_output)
        }
        "--run" => {
            let Some(context_path) = args.get(2) else {
                bail!("Usage: spine --run <context.json> [--strategy <name>] [--index <records.json>] [--json]");
            };
            let strategy = flag_value(&args, "--strategy");
            let index = flag_value(&args, "--index");
            run_run(Path::new(context_path), strategy, index.map(Path::new), json_output).await
        }
        "--history" => {
            let run_id = args.get(2).filter(|a| !a.starts_with("--")).map(String::as_str);
            let legacy = args.iter().any(|a| a == "--legacy");
            run_history(run_id, legacy)
        }
        "--review" => run_review(&args[2..]),
        "--verify-ledger" => run_verify_ledger(),
        "--stats" => run_stats(json_output),
        "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => bail!("Unknown command: {} (try --help)", other),
    }
}

fn print_usage() {
    println!("spine - reasoning spine CLI\n");
    println!("Commands:");
    println!("  --readiness <records.json> <required> [--optional <pointers>] [--json]");
    println!("  --run <context.json> [--strategy <name>] [--index <records.json>] [--json]");
    println!("  --history [<run-id> [--legacy]]");
    println!("  --review <object-id> --accepted|--blocked [--updates '<json>']");
    println!("  --verify-ledger");
    println!("  --stats [--json]");
    println!("\nPointers are comma separated, e.g. \"/inputs/site,/inputs/date\".");
}

/// Value following `flag`, if any
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn get_data_dir() -> PathBuf {
    default_data_dir()
}

fn open_spine() -> Result<Spine> {
    let data_dir = get_data_dir();
    let config = SpineConfig::load(&data_dir)?;
    let spine = Spine::init(config)?;
    tracing::info!("Ledger public key: {}", spine.ledger().public_key_hex());
    Ok(spine)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {:?}", path))
}

fn run_readiness(index_path: &Path, required: &str, optional: Option<&str>, json_output: bool) -> Result<()> {
    let records: Vec<CandidateRecord> = read_json(index_path)?;
    let requirements = InputRequirements {
        required: parse_pointer_list(required)?,
        optional: optional.map(parse_pointer_list).transpose()?.unwrap_or_default(),
    };

    let spine = open_spine()?;
    let fill = spine.readiness(&requirements, &records);

    if json_output {
        println!("{}", serde_json::to_string_pretty(&fill)?);
        return Ok(());
    }

    println!("\nREADINESS\n");
    println!("{}\n", fill.explanation);
    for (pointer, object_id) in &fill.mapping {
        println!("   {} <- {}", pointer, object_id);
    }
    if !fill.readiness.required_missing.is_empty() {
        println!("\nNot exposed by any record:");
        for pointer in &fill.readiness.required_missing {
            println!("   {}", pointer);
        }
    }

    println!("\nRANKED CANDIDATES:");
    for candidate in &fill.readiness.ranked_candidates {
        println!(
            "   {:.3} {} {}{}",
            candidate.total,
            if candidate.selected { "*" } else { " " },
            candidate.object_id,
            candidate.reason.as_deref().map(|r| format!(" - {}", r)).unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_run(
    context_path: &Path,
    strategy: Option<&str>,
    index_path: Option<&Path>,
    json_output: bool,
) -> Result<()> {
    let context: RunContext = read_json(context_path)?;
    let records: Option<Vec<CandidateRecord>> = index_path.map(read_json).transpose()?;

    let spine = open_spine()?;
    let run = spine.run(strategy, &context, records.as_deref()).await;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!("\nRUN {} ({})\n", context.run_id, run.strategy);
    println!("Status: {}", run.result.status.name());
    if let Some(message) = &run.result.message {
        println!("Message: {}", message);
    }
    println!();
    for event in &run.result.graph.events {
        println!("   {:>3} {:<28} {}", event.seq, event.kind().as_str(), event.title);
    }
    for outcome in &run.result.graph.outcomes {
        match outcome.confidence {
            Some(c) => println!("\nOutcome: {} (confidence {:.2})", outcome.headline, c),
            None => println!(
                "\nOutcome: {} (unscored: {})",
                outcome.headline,
                outcome.confidence_reason.as_deref().unwrap_or("")
            ),
        }
    }
    if !run.violations.is_empty() {
        println!("\nContract violations:");
        for violation in &run.violations {
            println!("   {}", violation);
        }
    }
    println!(
        "\nLearning: {} usage record(s), {} persisted, {} skipped",
        run.learning.evidence_usage_records.len(),
        run.learning.persisted_count,
        run.learning.skipped_count
    );
    for error in &run.learning.errors {
        println!("   error: {}", error);
    }
    match (&run.ledger_entry, &run.ledger_error) {
        (Some(entry), _) => println!("Sealed: {} (seq {})", entry.seal.content_hash, entry.seq),
        (None, Some(error)) => println!("Not sealed: {}", error),
        (None, None) => println!("Not sealed"),
    }
    Ok(())
}

fn run_history(run_id: Option<&str>, legacy: bool) -> Result<()> {
    let spine = open_spine()?;

    let Some(run_id) = run_id else {
        println!("\nLEDGER HISTORY\n");
        for entry in spine.ledger().history(20)? {
            println!(
                "   {:>4} {} {} {}",
                entry.seq,
                entry.sealed_at.format("%Y-%m-%d %H:%M:%S"),
                entry.run_id,
                &entry.seal.content_hash[..12.min(entry.seal.content_hash.len())]
            );
        }
        return Ok(());
    };

    let Some(graph) = spine.ledger().load(run_id)? else {
        bail!("No sealed graph for run {}", run_id);
    };
    if legacy {
        println!("{}", serde_json::to_string_pretty(&to_legacy_log(&graph))?);
    } else {
        println!("{}", serde_json::to_string_pretty(&graph)?);
    }
    Ok(())
}

fn run_review(args: &[String]) -> Result<()> {
    let Some(object_id) = args.first() else {
        bail!("Usage: spine --review <object-id> --accepted|--blocked [--updates '<json>']");
    };

    let action = if args.iter().any(|a| a == "--blocked") {
        ReviewAction::Blocked
    } else if args.iter().any(|a| a == "--accepted") {
        ReviewAction::Accepted
    } else {
        bail!("Review needs --accepted or --blocked");
    };
    let updates = match flag_value(args, "--updates") {
        Some(raw) => serde_json::from_str(raw).context("Invalid --updates JSON")?,
        None => serde_json::json!({}),
    };

    let spine = open_spine()?;
    let event = spine.review(object_id, action, updates);
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

fn run_verify_ledger() -> Result<()> {
    let spine = open_spine()?;
    let result = spine.verify_ledger()?;

    if result.valid {
        println!("Ledger valid: {} entries", result.chain_length);
        return Ok(());
    }

    println!("Ledger INVALID ({} entries):", result.chain_length);
    for error in &result.errors {
        println!("   {}", error);
    }
    bail!("{} verification error(s)", result.errors.len())
}

fn run_stats(json_output: bool) -> Result<()> {
    let spine = open_spine()?;
    let stats = spine.stats()?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_learning_stats(&stats);
    }
    Ok(())
}
