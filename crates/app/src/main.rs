use std::ops::ControlFlow;
use std::path::PathBuf;

use clap::Parser;
use shinku_core::{CoordinatorError, CoordinatorHandle, SessionCoordinator, SourceMonitor};
use shinku_llm::Message;
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod commands;
mod presenter;
mod settings;

use commands::TerminalCommand;
use settings::{RuntimeOverrides, SettingsStore};

const DEFAULT_LOG_FILTER: &str = "shinku=info,shinku_core=info,shinku_llm=info";

/// Watches the clipboard and streams a translation of every new line.
#[derive(Debug, Parser)]
#[command(name = "shinku", version, long_about = None)]
struct Cli {
    /// Settings file to use instead of the per-user default.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Monitor a text file instead of the clipboard.
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Poll interval in milliseconds.
    #[arg(long, value_name = "N")]
    interval_ms: Option<u64>,
    /// Model name sent with each request.
    #[arg(long, value_name = "NAME")]
    model: Option<String>,
}

impl Cli {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            model_name: self.model.clone(),
            source_file: self.file.clone(),
            poll_interval_ms: self.interval_ms,
        }
    }
}

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to listen for ctrl-c: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("coordinator unavailable: {source}"))]
    Coordinator { source: CoordinatorError },
    #[snafu(display("background task `{task}` failed: {source}"))]
    Join {
        task: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("failed to write output: {source}"))]
    Output { source: std::io::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(SettingsStore::default_config_path);
    let store = SettingsStore::open(config_path, cli.overrides());
    let settings = store.settings();
    tracing::info!(
        path = ?store.config_path(),
        endpoint = %settings.session.endpoint,
        model = %settings.session.model_name,
        source = ?settings.source,
        "settings loaded"
    );

    let monitor = SourceMonitor::new(settings.source.to_text_source())
        .await
        .with_interval(settings.poll_interval());
    let (coordinator, handle, events) =
        SessionCoordinator::new(monitor, store.session_config(), shinku_llm::create_backend());
    let coordinator_task = coordinator.spawn();
    let (history_tx, history_rx) = mpsc::unbounded_channel();
    let presenter_task = tokio::spawn(presenter::run(events, history_rx));

    run_terminal(&store, &handle, &history_tx).await?;
    drop(history_tx);

    handle.shutdown().await.context(CoordinatorSnafu)?;
    coordinator_task.await.context(JoinSnafu {
        task: "coordinator",
    })?;
    presenter_task
        .await
        .context(JoinSnafu { task: "presenter" })?
        .context(OutputSnafu)?;
    Ok(())
}

/// Reads stdin commands until `:quit` or ctrl-c. Closed stdin leaves only ctrl-c.
async fn run_terminal(
    store: &SettingsStore,
    handle: &CoordinatorHandle,
    history_tx: &mpsc::UnboundedSender<Vec<Message>>,
) -> Result<(), AppError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line.context(TerminalSnafu { stage: "read-stdin-line" })? {
                    Some(line) => {
                        if let ControlFlow::Break(()) = dispatch(&line, store, handle, history_tx).await? {
                            return Ok(());
                        }
                    }
                    None => {
                        tracing::debug!("stdin closed; press ctrl-c to exit");
                        stdin_open = false;
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context(SignalSnafu)?;
                return Ok(());
            }
        }
    }
}

async fn dispatch(
    line: &str,
    store: &SettingsStore,
    handle: &CoordinatorHandle,
    history_tx: &mpsc::UnboundedSender<Vec<Message>>,
) -> Result<ControlFlow<()>, AppError> {
    let Some(command) = TerminalCommand::parse(line) else {
        return Ok(ControlFlow::Continue(()));
    };

    match command {
        TerminalCommand::Quit => return Ok(ControlFlow::Break(())),
        TerminalCommand::Submit(content) => handle.submit(content).context(CoordinatorSnafu)?,
        TerminalCommand::Clear => handle.clear_history().await.context(CoordinatorSnafu)?,
        TerminalCommand::History => {
            let status = handle.status().await.context(CoordinatorSnafu)?;
            if history_tx.send(status.history).is_err() {
                tracing::warn!("presenter stopped; history not shown");
            }
        }
        TerminalCommand::Param(param) => match store.apply_custom_param(&param) {
            Ok(settings) => tracing::info!(
                custom_params = %settings.session.custom_params.to_lines(),
                "custom parameters updated"
            ),
            Err(error) => tracing::warn!(error = %error, "custom parameter not applied"),
        },
        TerminalCommand::Reload => match store.reload() {
            Ok(_) => tracing::info!(
                "settings reloaded; source and poll interval changes apply after restart"
            ),
            Err(error) => tracing::warn!(error = %error, "settings reload failed"),
        },
    }

    Ok(ControlFlow::Continue(()))
}
