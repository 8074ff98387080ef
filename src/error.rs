use std::{
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// An `io::Error` paired with the path that produced it.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct BuildIoError {
    io: io::Error,
    path: PathBuf,
}

impl BuildIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at the root of this error.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn io_error(&self) -> &io::Error {
        &self.io
    }
}

impl From<BuildIoError> for io::Error {
    fn from(err: BuildIoError) -> Self {
        err.io
    }
}

/// Various errors the build orchestrator can emit.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] BuildIoError),
    /// A diagnostic attributed to a location in a cakelisp source file.
    #[error("{}:{line}:{column}: error: {message}", .file.display())]
    Source { file: PathBuf, line: u32, column: u32, message: String },
    /// The build output directory has been decided; labels can no longer change.
    #[error("build configuration labels are final; the build output directory was already decided")]
    ConfigurationLabelsFinal,
    #[error("{hook} hook returned failure, aborting build")]
    HookFailed { hook: &'static str },
    /// One or more compile child processes exited nonzero or produced no object file.
    #[error("failed to build {} object file(s)", .failed.len())]
    BuildFailed { failed: Vec<PathBuf> },
    #[error("linker exited with status {status}\n{output}")]
    LinkFailed { status: i32, output: String },
    #[error("execution of {} returned non-zero exit code {status}", .executable.display())]
    ExecuteFailed { executable: PathBuf, status: i32 },
    #[error("{0}")]
    Message(String),
}

impl BuildError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        BuildIoError::new(err, path).into()
    }

    pub(crate) fn msg(msg: impl std::fmt::Display) -> Self {
        BuildError::Message(msg.to_string())
    }

    pub(crate) fn at(
        file: impl Into<PathBuf>,
        line: u32,
        column: u32,
        message: impl std::fmt::Display,
    ) -> Self {
        BuildError::Source { file: file.into(), line, column, message: message.to_string() }
    }
}
