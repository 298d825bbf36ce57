//! `pyrunner run`: execute code once and render its updates

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use colored::*;
use pyrunner_execution::{ExecutionUpdate, ExecutorService, PlotType};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct RunOptions {
    pub output_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub json: bool,
}

/// Resolve the code to run from `--code`, a file, or stdin (`-`)
pub async fn read_source(file: Option<&Path>, code: Option<String>) -> Result<String> {
    match (file, code) {
        (_, Some(code)) => Ok(code),
        (Some(path), None) if path == Path::new("-") => {
            let mut source = String::new();
            tokio::io::stdin()
                .read_to_string(&mut source)
                .await
                .context("Failed to read code from stdin")?;
            Ok(source)
        }
        (Some(path), None) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read code from {:?}", path)),
        (None, None) => bail!("No code given: pass a FILE, '-' to read stdin, or --code"),
    }
}

/// Run `code` to completion. Returns whether it ended in `success`.
pub async fn execute(executor: &ExecutorService, code: String, options: &RunOptions) -> Result<bool> {
    if let Some(dir) = &options.output_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    executor
        .run(code, move |update| {
            let _ = tx.send(update);
        })
        .await;

    let mut printer = UpdatePrinter::new(options);
    let mut deadline = options.timeout.map(|timeout| Instant::now() + timeout);

    loop {
        let next = match deadline {
            Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!("Execution timed out, stopping it");
                    eprintln!(
                        "{} {}",
                        "⚠".bright_yellow().bold(),
                        format!(
                            "Execution exceeded {}s, stopping",
                            options.timeout.unwrap_or_default().as_secs_f64()
                        )
                        .bright_yellow()
                    );
                    executor.stop();
                    deadline = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        let Some(update) = next else {
            bail!("Execution ended without a result");
        };

        let succeeded = matches!(update, ExecutionUpdate::Success);
        let terminal = update.is_terminal();
        printer.print(update).await?;
        if terminal {
            return Ok(succeeded);
        }
    }
}

struct UpdatePrinter<'a> {
    options: &'a RunOptions,
    plots: usize,
}

impl<'a> UpdatePrinter<'a> {
    fn new(options: &'a RunOptions) -> Self {
        Self { options, plots: 0 }
    }

    async fn print(&mut self, update: ExecutionUpdate) -> Result<()> {
        if self.options.json {
            println!(
                "{}",
                serde_json::to_string(&update).context("Failed to serialize update")?
            );
            return Ok(());
        }

        match update {
            ExecutionUpdate::Stdout { data } => println!("{}", data),
            ExecutionUpdate::Stderr { error } => eprintln!("{}", error.red()),
            ExecutionUpdate::Plot { plot_type, data } => {
                self.plots += 1;
                let filename = plot_filename(self.plots, plot_type);
                let bytes = if plot_type.is_raster() {
                    STANDARD.decode(&data).context("Plot data is not valid base64")?
                } else {
                    data.into_bytes()
                };
                self.save(&filename, &bytes, &format!("{} plot", plot_type))
                    .await?;
            }
            ExecutionUpdate::Download {
                filename,
                mimetype,
                data,
            } => {
                let bytes = STANDARD
                    .decode(&data)
                    .with_context(|| format!("Download '{}' is not valid base64", filename))?;
                self.save(&filename, &bytes, &format!("file ({})", mimetype))
                    .await?;
            }
            ExecutionUpdate::Success => debug!("Execution succeeded"),
            ExecutionUpdate::Error { error } => {
                eprintln!("{} {}", "✗".bright_red().bold(), error.bright_red())
            }
        }
        Ok(())
    }

    async fn save(&self, filename: &str, bytes: &[u8], what: &str) -> Result<()> {
        let Some(dir) = &self.options.output_dir else {
            eprintln!(
                "{} {} '{}' ({} bytes), use --output-dir to save it",
                "ℹ".bright_blue().bold(),
                what,
                filename,
                bytes.len()
            );
            return Ok(());
        };

        let Some(relative) = safe_relative_path(filename) else {
            eprintln!(
                "{} {}",
                "⚠".bright_yellow().bold(),
                format!("Refusing to write {} to unsafe path '{}'", what, filename).bright_yellow()
            );
            return Ok(());
        };

        let target = dir.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("Failed to write {:?}", target))?;

        eprintln!(
            "{} {} saved to {}",
            "✓".bright_green().bold(),
            what,
            target.display()
        );
        Ok(())
    }
}

fn plot_filename(index: usize, plot_type: PlotType) -> String {
    let extension = if plot_type.is_raster() { "png" } else { "json" };
    format!("plot-{}-{}.{}", index, plot_type, extension)
}

/// Keep only plain path components so files land inside the output directory
fn safe_relative_path(filename: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(filename).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}
