//! Structured output capture
//!
//! Executed code only has a text channel back to us, so figures, images and
//! in-memory downloads travel as tagged stdout lines of the form
//! `__PYRUNNER_ARTIFACT__:<kind>:<payload>`. The preamble below rewrites the
//! relevant `show()` entry points to print such lines; [`classify_stdout_line`]
//! turns them back into typed updates before anything reaches a caller. The
//! sentinel never appears in an update.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use pyrunner_ipc::{ExecutionUpdate, PlotType};
use serde::Deserialize;
use std::path::Path;

use crate::capture::guess_mimetype;

/// Prefix marking a stdout line as a structured artifact
pub const ARTIFACT_SENTINEL: &str = "__PYRUNNER_ARTIFACT__";

const PREAMBLE_TEMPLATE: &str = include_str!("python/preamble.py");

/// Build the preamble executed ahead of user code for one execution.
///
/// Switches matplotlib to a headless backend, redirects plot/image/chart
/// `show()` calls into tagged lines and changes into `workdir`.
pub fn compose_preamble(workdir: &Path) -> String {
    PREAMBLE_TEMPLATE
        .replace("$PYRUNNER_SENTINEL", &python_string_literal(ARTIFACT_SENTINEL))
        .replace(
            "$PYRUNNER_WORKDIR",
            &python_string_literal(&workdir.to_string_lossy()),
        )
}

/// JSON string literals are valid Python string literals
fn python_string_literal(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[derive(Debug, Deserialize)]
struct DownloadPayload {
    filename: String,
    #[serde(default)]
    mimetype: Option<String>,
    data: String,
}

/// Turn one captured stdout line into the updates a caller should see.
///
/// Untagged lines pass through as a single `stdout` update. A tag may follow
/// text the code wrote without a trailing newline; that text comes first as
/// `stdout`, then the artifact. A tag with an unknown kind or a broken
/// payload becomes a `stderr` notice so the sentinel never leaks into plain
/// output.
pub fn classify_stdout_line(line: String) -> Vec<ExecutionUpdate> {
    let Some(start) = line.find(ARTIFACT_SENTINEL) else {
        return vec![ExecutionUpdate::Stdout { data: line }];
    };

    let mut updates = Vec::with_capacity(2);
    if start > 0 {
        updates.push(ExecutionUpdate::stdout(&line[..start]));
    }
    updates.push(classify_artifact(&line[start + ARTIFACT_SENTINEL.len()..]));
    updates
}

/// `tag` is everything after the sentinel: `:<kind>:<payload>`
fn classify_artifact(tag: &str) -> ExecutionUpdate {
    let Some((kind, payload)) = tag
        .strip_prefix(':')
        .and_then(|rest| rest.split_once(':'))
    else {
        return ExecutionUpdate::stderr("Discarded malformed artifact: missing kind or payload");
    };

    let parsed = match kind {
        "matplotlib" | "pil" => parse_raster(kind, payload),
        "plotly" => parse_chart(payload),
        "download" => parse_download(payload),
        _ => {
            return ExecutionUpdate::stderr(format!(
                "Discarded artifact of unknown kind '{}'",
                kind.replace(ARTIFACT_SENTINEL, "")
            ))
        }
    };

    parsed.unwrap_or_else(|reason| {
        ExecutionUpdate::stderr(format!("Discarded malformed {} artifact: {}", kind, reason))
    })
}

fn parse_raster(kind: &str, payload: &str) -> Result<ExecutionUpdate, String> {
    let plot_type: PlotType = kind.parse()?;
    let payload = payload.trim();
    STANDARD
        .decode(payload)
        .map_err(|e| format!("invalid base64 image data: {}", e))?;

    Ok(ExecutionUpdate::Plot {
        plot_type,
        data: payload.to_string(),
    })
}

fn parse_chart(payload: &str) -> Result<ExecutionUpdate, String> {
    let figure: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| format!("invalid chart JSON: {}", e))?;
    if !figure.is_object() {
        return Err("chart specification must be a JSON object".to_string());
    }

    Ok(ExecutionUpdate::Plot {
        plot_type: PlotType::Plotly,
        data: payload.to_string(),
    })
}

fn parse_download(payload: &str) -> Result<ExecutionUpdate, String> {
    let download: DownloadPayload =
        serde_json::from_str(payload).map_err(|e| format!("invalid download payload: {}", e))?;

    if download.filename.trim().is_empty() {
        return Err("download filename is empty".to_string());
    }
    STANDARD
        .decode(&download.data)
        .map_err(|e| format!("invalid base64 file data: {}", e))?;

    let mimetype = download
        .mimetype
        .unwrap_or_else(|| guess_mimetype(&download.filename).to_string());

    Ok(ExecutionUpdate::Download {
        filename: download.filename,
        mimetype,
        data: download.data,
    })
}
