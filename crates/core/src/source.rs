use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use snafu::{ResultExt, Snafu, ensure};
use tokio::process::Command;

pub type ReadFuture<'a> = Pin<Box<dyn Future<Output = Result<String, SourceError>> + Send + 'a>>;

/// Read-only accessor for the monitored text. Reads may fail at any time.
///
/// Reads must not block the thread: the returned future is awaited on the
/// runtime and dropped when it takes too long.
pub trait TextSource: Send {
    fn read(&mut self) -> ReadFuture<'_>;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SourceError {
    #[snafu(display("failed to read source file {path:?}: {source}"))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to run `{program}`: {source}"))]
    SpawnCommand {
        program: String,
        source: std::io::Error,
    },
    #[snafu(display("`{program}` exited with {status}"))]
    CommandStatus { program: String, status: String },
    #[snafu(display("`{program}` produced output that is not UTF-8"))]
    InvalidUtf8 {
        program: String,
        source: std::string::FromUtf8Error,
    },
}

/// Reads the whole content of a text file on every poll.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TextSource for FileSource {
    fn read(&mut self) -> ReadFuture<'_> {
        Box::pin(async move {
            tokio::fs::read_to_string(&self.path)
                .await
                .context(ReadFileSnafu {
                    path: self.path.clone(),
                })
        })
    }
}

/// Runs an external program and captures its stdout, e.g. a clipboard utility.
///
/// Dropping an unfinished read kills the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSource {
    program: String,
    args: Vec<String>,
}

impl CommandSource {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Clipboard reader for the current platform.
    pub fn clipboard() -> Self {
        let (program, args) = if cfg!(target_os = "macos") {
            ("pbpaste", vec![])
        } else if cfg!(target_os = "windows") {
            (
                "powershell",
                vec!["-NoProfile", "-Command", "Get-Clipboard -Raw"],
            )
        } else if std::env::var_os("WAYLAND_DISPLAY").is_some() {
            ("wl-paste", vec!["--no-newline"])
        } else {
            ("xclip", vec!["-selection", "clipboard", "-o"])
        };
        Self::new(program, args.iter().map(|arg| arg.to_string()).collect())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl TextSource for CommandSource {
    fn read(&mut self) -> ReadFuture<'_> {
        Box::pin(async move {
            let output = Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .context(SpawnCommandSnafu {
                    program: self.program.clone(),
                })?;

            ensure!(
                output.status.success(),
                CommandStatusSnafu {
                    program: self.program.clone(),
                    status: output.status.to_string(),
                }
            );

            String::from_utf8(output.stdout).context(InvalidUtf8Snafu {
                program: self.program.clone(),
            })
        })
    }
}
