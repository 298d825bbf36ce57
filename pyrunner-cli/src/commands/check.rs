//! `pyrunner check`: start the interpreter and report what it loaded

use colored::*;
use pyrunner_execution::ExecutorService;
use tracing::error;

pub async fn check(executor: &ExecutorService) -> bool {
    let interpreter = &executor.config().interpreter;
    println!(
        "{} Starting {} with {} packages",
        "ℹ".bright_blue().bold(),
        interpreter.python_executable,
        interpreter.packages.len()
    );

    match executor.ready().await {
        Ok(info) => {
            println!(
                "{} Python {} is ready",
                "✓".bright_green().bold(),
                info.python_version
            );
            for package in &info.packages {
                println!("  {}", package);
            }
            true
        }
        Err(e) => {
            error!("Interpreter check failed: {}", e);
            eprintln!("{} {}", "✗".bright_red().bold(), e.to_string().bright_red());
            false
        }
    }
}
