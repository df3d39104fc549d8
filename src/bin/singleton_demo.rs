// Runs the concurrency harness against each initialization strategy and
// prints a verdict table.
//
// Usage: singleton_demo [config.toml] [strategy]
// Log level comes from RUST_LOG (default: singleton_slots=info).

use std::env;
use std::error::Error;
use std::process::ExitCode;

use colored::{ColoredString, Colorize};
use singleton_slots::{ConcurrencyHarness, HarnessConfig, RunReport, Verdict};
use tracing_subscriber::EnvFilter;

fn yes_no(flag: bool) -> ColoredString {
    if flag {
        "yes".green()
    } else {
        "no".red()
    }
}

fn verdict_label(report: &RunReport) -> ColoredString {
    match report.verdict() {
        Verdict::Upheld => "OK".green().bold(),
        Verdict::Violated => "VIOLATED".red().bold(),
        Verdict::DefectDemonstrated => "BROKEN (expected)".yellow().bold(),
        Verdict::DefectNotReproduced => "race not hit".yellow(),
    }
}

fn print_table(reports: &[RunReport]) {
    println!(
        "{:<22} {:>11} {:>11} {:>13} {:>9} {:>9} {:>10}  {}",
        "strategy",
        "thread-safe",
        "recommended",
        "constructions",
        "distinct",
        "fast path",
        "elapsed",
        "verdict"
    );
    println!("{}", "-".repeat(110).dimmed());
    for report in reports {
        let strategy = report.strategy;
        println!(
            "{:<22} {:>11} {:>11} {:>13} {:>9} {:>9} {:>8}ms  {}",
            strategy.name().bold(),
            yes_no(strategy.is_thread_safe()),
            yes_no(strategy.is_recommended()),
            report.constructions,
            report.distinct_instances,
            report.fast_path_hits,
            report.elapsed.as_millis(),
            verdict_label(report),
        );
    }
}

fn run() -> Result<bool, Box<dyn Error>> {
    let config = HarnessConfig::from_args(env::args().skip(1))?;
    println!(
        "{} {} callers, {}ms constructor delay, up to {} rounds\n",
        "Hammering singleton slots:".cyan().bold(),
        config.callers,
        config.constructor_delay_ms,
        config.rounds
    );

    let harness = ConcurrencyHarness::new(config);
    let reports = harness.run_all()?;
    print_table(&reports);

    let violations = reports
        .iter()
        .filter(|r| r.verdict() == Verdict::Violated)
        .count();
    println!();
    if violations == 0 {
        println!("{}", "✓ Every thread-safe strategy built exactly one instance".green());
    } else {
        let message =
            format!("✗ {violations} thread-safe strategy run(s) built more than one instance");
        println!("{}", message.red());
    }
    Ok(violations == 0)
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("singleton_slots=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            ExitCode::from(2)
        }
    }
}
