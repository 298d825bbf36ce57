//! End-to-end tests for the executor service against a real Python interpreter
//!
//! Each test skips itself when no `python3` is on the PATH.

use pyrunner_config::{ExecutionConfig, InterpreterConfig, PackageRequirement, PyrunnerConfig};
use pyrunner_execution::{ExecutionError, ExecutionUpdate, ExecutorService, PlotType, Readiness};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const UPDATE_TIMEOUT: Duration = Duration::from_secs(60);

fn python_available() -> bool {
    let available = std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);
    if !available {
        eprintln!("python3 not found, skipping");
    }
    available
}

fn test_config() -> PyrunnerConfig {
    PyrunnerConfig {
        interpreter: InterpreterConfig {
            python_executable: "python3".to_string(),
            packages: Vec::new(),
            install_missing: false,
            init_timeout: Duration::from_secs(60),
        },
        ..PyrunnerConfig::default()
    }
}

fn channel_callback() -> (
    impl FnMut(ExecutionUpdate) + Send + 'static,
    mpsc::UnboundedReceiver<ExecutionUpdate>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |update| {
            let _ = tx.send(update);
        },
        rx,
    )
}

/// Receive updates up to and including the terminal one
async fn until_terminal(rx: &mut mpsc::UnboundedReceiver<ExecutionUpdate>) -> Vec<ExecutionUpdate> {
    let mut updates = Vec::new();
    loop {
        let update = timeout(UPDATE_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for updates")
            .expect("callback dropped before a terminal update");
        let terminal = update.is_terminal();
        updates.push(update);
        if terminal {
            return updates;
        }
    }
}

async fn run_to_end(service: &ExecutorService, code: &str) -> Vec<ExecutionUpdate> {
    let (on_update, mut rx) = channel_callback();
    service.run(code, on_update).await;
    until_terminal(&mut rx).await
}

fn error_text(update: &ExecutionUpdate) -> &str {
    match update {
        ExecutionUpdate::Error { error } => error,
        other => panic!("expected error update, got {:?}", other),
    }
}

#[tokio::test]
async fn test_print_produces_stdout_then_success() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();

    let updates = run_to_end(&service, "print(1+1)").await;
    assert_eq!(
        updates,
        vec![ExecutionUpdate::stdout("2"), ExecutionUpdate::Success]
    );
    assert!(!service.is_executing());
}

#[tokio::test]
async fn test_raised_fault_is_terminal_error() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();

    let updates = run_to_end(&service, "raise ValueError('bad')").await;
    assert_eq!(updates.len(), 1);
    assert!(error_text(&updates[0]).contains("bad"));
}

#[tokio::test]
async fn test_partial_output_precedes_fault() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();

    let updates = run_to_end(&service, "print('hello')\nraise ValueError('bad')").await;
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0], ExecutionUpdate::stdout("hello"));
    let error = error_text(&updates[1]);
    assert!(error.contains("ValueError: bad"));
    assert!(error.contains("<cell>"));
}

#[tokio::test]
async fn test_concurrent_run_is_rejected() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();

    let (first, mut first_rx) = channel_callback();
    let (second, mut second_rx) = channel_callback();
    service
        .run("import time\ntime.sleep(1)\nprint('first done')", first)
        .await;
    assert!(service.is_executing());
    service.run("print('second')", second).await;

    let rejected = until_terminal(&mut second_rx).await;
    assert_eq!(
        rejected,
        vec![ExecutionUpdate::error("another execution is already in progress")]
    );

    let completed = until_terminal(&mut first_rx).await;
    assert_eq!(
        completed,
        vec![ExecutionUpdate::stdout("first done"), ExecutionUpdate::Success]
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(second_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_stop_interrupts_and_recovers() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();
    service.ready().await.unwrap();
    let first_worker = service.worker_id();

    let (on_update, mut rx) = channel_callback();
    service
        .run("print('looping', flush=True)\nwhile True:\n    pass", on_update)
        .await;
    assert_eq!(
        timeout(UPDATE_TIMEOUT, rx.recv()).await.unwrap(),
        Some(ExecutionUpdate::stdout("looping"))
    );

    service.stop();
    assert!(!service.is_executing());
    assert_ne!(service.worker_id(), first_worker);

    let stopped = until_terminal(&mut rx).await;
    assert_eq!(stopped, vec![ExecutionUpdate::error("Execution stopped by user")]);

    let updates = run_to_end(&service, "print('ok')").await;
    assert_eq!(
        updates,
        vec![ExecutionUpdate::stdout("ok"), ExecutionUpdate::Success]
    );
}

#[tokio::test]
async fn test_nothing_delivered_after_terminal() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();

    let (on_update, mut rx) = channel_callback();
    service.run("print('done')", on_update).await;
    let updates = until_terminal(&mut rx).await;
    assert_eq!(updates.last(), Some(&ExecutionUpdate::Success));

    service.stop();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_concurrent_ready_shares_one_worker() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();

    let (a, b, c, d) = tokio::join!(
        service.ready(),
        service.ready(),
        service.ready(),
        service.ready()
    );
    let worker = service.worker_id();
    assert!(worker.is_some());

    let info = a.unwrap();
    assert_eq!(b.unwrap(), info);
    assert_eq!(c.unwrap(), info);
    assert_eq!(d.unwrap(), info);
    assert!(info.python_version.starts_with('3'));

    assert_eq!(service.ready().await.unwrap(), info);
    assert_eq!(service.worker_id(), worker);
    assert_eq!(service.environment(), Some(info.clone()));
    assert_eq!(service.readiness(), Some(Readiness::Ready(info)));
}

#[tokio::test]
async fn test_missing_package_fails_initialization() {
    if !python_available() {
        return;
    }
    let mut config = test_config();
    config.interpreter.packages = vec![PackageRequirement::new("pyrunner_missing_module_for_tests")];
    let service = ExecutorService::new(config).unwrap();

    let (a, b) = tokio::join!(service.ready(), service.ready());
    for result in [a, b] {
        match result {
            Err(ExecutionError::InitializationFailed(reason)) => {
                assert!(reason.contains("pyrunner_missing_module_for_tests"))
            }
            other => panic!("expected initialization failure, got {:?}", other),
        }
    }

    let updates = run_to_end(&service, "print(1)").await;
    assert!(error_text(&updates[0]).starts_with("Python environment failed to load:"));
    assert_eq!(updates.len(), 1);
}

#[tokio::test]
async fn test_each_execution_gets_a_fresh_namespace() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();

    assert_eq!(run_to_end(&service, "x = 41").await, vec![ExecutionUpdate::Success]);
    let updates = run_to_end(&service, "print(x + 1)").await;
    assert!(error_text(updates.last().unwrap()).contains("NameError"));
}

#[tokio::test]
async fn test_stdin_is_empty_and_exit_codes_are_reported() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();

    let updates = run_to_end(&service, "input('name? ')").await;
    assert!(error_text(updates.last().unwrap()).contains("EOFError"));

    let updates = run_to_end(&service, "import sys\nsys.exit(3)").await;
    assert!(error_text(updates.last().unwrap()).contains("SystemExit: 3"));

    let updates = run_to_end(&service, "import sys\nsys.exit(0)").await;
    assert_eq!(updates, vec![ExecutionUpdate::Success]);
}

#[tokio::test]
async fn test_stderr_and_raw_descriptor_writes() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();

    let code = "import os, sys\nprint('warn', file=sys.stderr)\nos.write(1, b'raw\\n')\nprint('out')";
    let updates = run_to_end(&service, code).await;
    assert_eq!(
        updates,
        vec![
            ExecutionUpdate::stderr("warn"),
            ExecutionUpdate::stdout("out"),
            ExecutionUpdate::Success,
        ]
    );
}

#[tokio::test]
async fn test_interpreter_crash_is_reported_and_recovered() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();

    let updates = run_to_end(&service, "import os\nos._exit(3)").await;
    assert_eq!(updates.len(), 1);
    assert!(error_text(&updates[0]).starts_with("Python interpreter exited unexpectedly"));

    let updates = run_to_end(&service, "print('back')").await;
    assert_eq!(
        updates,
        vec![ExecutionUpdate::stdout("back"), ExecutionUpdate::Success]
    );
}

#[tokio::test]
async fn test_tagged_plot_line_never_leaks() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();

    let code = r#"
import base64
print("before")
print("__PYRUNNER_ARTIFACT__:matplotlib:" + base64.b64encode(b"\x89PNG\r\n\x1a\n").decode())
print("after")
"#;
    let updates = run_to_end(&service, code).await;
    assert_eq!(
        updates,
        vec![
            ExecutionUpdate::stdout("before"),
            ExecutionUpdate::Plot {
                plot_type: PlotType::Matplotlib,
                data: "iVBORw0KGgo=".to_string(),
            },
            ExecutionUpdate::stdout("after"),
            ExecutionUpdate::Success,
        ]
    );
}

#[tokio::test]
async fn test_matplotlib_show_becomes_one_plot() {
    if !python_available() {
        return;
    }
    let has_matplotlib = std::process::Command::new("python3")
        .args(["-c", "import matplotlib"])
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    if !has_matplotlib {
        eprintln!("matplotlib not installed, skipping");
        return;
    }

    let service = ExecutorService::new(test_config()).unwrap();
    let code = "import matplotlib.pyplot as plt\nplt.plot([1, 2, 3])\nplt.show()";
    let updates = run_to_end(&service, code).await;

    let plots = updates
        .iter()
        .filter(|update| matches!(update, ExecutionUpdate::Plot { plot_type: PlotType::Matplotlib, .. }))
        .count();
    assert_eq!(plots, 1);
    assert!(updates.iter().all(|update| match update {
        ExecutionUpdate::Stdout { data } => !data.contains("__PYRUNNER_ARTIFACT__"),
        _ => true,
    }));
    assert_eq!(updates.last(), Some(&ExecutionUpdate::Success));
}

#[tokio::test]
async fn test_written_files_become_downloads() {
    if !python_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.execution = ExecutionConfig {
        workdir_root: Some(root.path().to_path_buf()),
        ..ExecutionConfig::default()
    };
    let service = ExecutorService::new(config).unwrap();

    let code = r#"
import os
with open("results.csv", "w") as f:
    f.write("a,b\n1,2\n")
os.makedirs("charts")
with open(os.path.join("charts", "data.json"), "w") as f:
    f.write("{}")
pyrunner_download("notes.txt", "in memory")
"#;
    let updates = run_to_end(&service, code).await;

    let downloads: Vec<(&str, &str)> = updates
        .iter()
        .filter_map(|update| match update {
            ExecutionUpdate::Download {
                filename, mimetype, ..
            } => Some((filename.as_str(), mimetype.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(
        downloads,
        vec![
            ("notes.txt", "text/plain"),
            ("charts/data.json", "application/json"),
            ("results.csv", "text/csv"),
        ]
    );
    assert_eq!(updates.last(), Some(&ExecutionUpdate::Success));

    // The per-execution directory is gone afterwards
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_artifact_after_partial_line_is_extracted() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();

    let code = "print('progress: ', end='')\npyrunner_download('a.txt', 'hi')\nprint('done')";
    let updates = run_to_end(&service, code).await;
    assert_eq!(
        updates,
        vec![
            ExecutionUpdate::stdout("progress: "),
            ExecutionUpdate::Download {
                filename: "a.txt".to_string(),
                mimetype: "text/plain".to_string(),
                data: "aGk=".to_string(),
            },
            ExecutionUpdate::stdout("done"),
            ExecutionUpdate::Success,
        ]
    );
}

/// Registers a minimal `plotly.basedatatypes` so the chart hook can be
/// exercised without plotly installed. Modules outlive the namespace.
const STUB_PLOTLY: &str = r#"
import sys, types
plotly = types.ModuleType("plotly")
base = types.ModuleType("plotly.basedatatypes")

class BaseFigure:
    def __init__(self, figure):
        self._figure = figure

    def to_plotly_json(self):
        return self._figure

    def show(self):
        print("native show")

base.BaseFigure = BaseFigure
plotly.basedatatypes = base
sys.modules["plotly"] = plotly
sys.modules["plotly.basedatatypes"] = base
"#;

#[tokio::test]
async fn test_chart_values_are_narrowed_to_json() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();
    assert_eq!(
        run_to_end(&service, STUB_PLOTLY).await,
        vec![ExecutionUpdate::Success]
    );

    let code = r#"
import datetime
from plotly.basedatatypes import BaseFigure

class Series:
    def __init__(self, values):
        self.values = values

    def tolist(self):
        return list(self.values)

try:
    import numpy as np
    extra = {"ints": np.arange(3), "scalar": np.float64(1.5), "flag": np.bool_(True)}
except ImportError:
    extra = {"ints": Series([0, 1, 2]), "scalar": 1.5, "flag": True}

BaseFigure({
    "data": [{"type": "bar", "y": Series([1, 2, 3])}],
    "layout": {"title": datetime.date(2024, 1, 2)},
    "extra": extra,
}).show()
print("done")
"#;
    let updates = run_to_end(&service, code).await;
    assert_eq!(updates.len(), 3, "unexpected updates: {:?}", updates);

    let figure: serde_json::Value = match &updates[0] {
        ExecutionUpdate::Plot {
            plot_type: PlotType::Plotly,
            data,
        } => serde_json::from_str(data).unwrap(),
        other => panic!("expected plotly plot, got {:?}", other),
    };
    assert_eq!(figure["data"][0]["y"], serde_json::json!([1, 2, 3]));
    assert_eq!(figure["layout"]["title"], "2024-01-02");
    assert_eq!(figure["extra"]["ints"], serde_json::json!([0, 1, 2]));
    assert_eq!(figure["extra"]["scalar"], 1.5);
    assert_eq!(figure["extra"]["flag"], true);

    assert_eq!(updates[1], ExecutionUpdate::stdout("done"));
    assert_eq!(updates[2], ExecutionUpdate::Success);
}

#[tokio::test]
async fn test_chart_serialization_failure_keeps_output() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();
    run_to_end(&service, STUB_PLOTLY).await;

    let code = r#"
from plotly.basedatatypes import BaseFigure
print("before")
BaseFigure({"data": [{"y": [float("nan")]}]}).show()
BaseFigure({"data": [{"y": object()}]}).show()
print("after")
"#;
    let updates = run_to_end(&service, code).await;
    assert_eq!(updates.len(), 5, "unexpected updates: {:?}", updates);
    assert_eq!(updates[0], ExecutionUpdate::stdout("before"));
    for update in &updates[1..3] {
        match update {
            ExecutionUpdate::Stderr { error } => {
                assert!(error.starts_with("Chart serialization failed:"), "{}", error)
            }
            other => panic!("expected stderr notice, got {:?}", other),
        }
    }
    assert_eq!(updates[3], ExecutionUpdate::stdout("after"));
    assert_eq!(updates[4], ExecutionUpdate::Success);
}

#[tokio::test]
async fn test_callback_can_stop_its_own_execution() {
    if !python_available() {
        return;
    }
    let service = ExecutorService::new(test_config()).unwrap();
    service.ready().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = service.clone();
    service
        .run(
            "print('looping', flush=True)\nwhile True:\n    pass",
            move |update: ExecutionUpdate| {
                let stop_now = update == ExecutionUpdate::stdout("looping");
                let _ = tx.send(update);
                if stop_now {
                    controller.stop();
                }
            },
        )
        .await;

    let updates = until_terminal(&mut rx).await;
    assert_eq!(
        updates,
        vec![
            ExecutionUpdate::stdout("looping"),
            ExecutionUpdate::error("Execution stopped by user"),
        ]
    );
    assert!(!service.is_executing());

    let updates = run_to_end(&service, "print('ok')").await;
    assert_eq!(
        updates,
        vec![ExecutionUpdate::stdout("ok"), ExecutionUpdate::Success]
    );
}
