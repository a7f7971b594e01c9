//! Run-terminating error type. Everything here is a setup-phase failure;
//! anomalies seen while polling stay inside [`crate::protocol::ProtocolError`]
//! and degrade to failed checks instead of ending the run.

use std::io;
use std::path::PathBuf;

use crate::protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("can't find programming script {0:?}")]
    MissingScript(PathBuf),
    #[error("failed to launch {tool}: {source}")]
    ToolLaunch { tool: String, source: io::Error },
    #[error("{script:?} exited with status {code}")]
    ToolFailed { script: PathBuf, code: i32 },
    #[error("failed to write flash image {file:?}: {source}")]
    ImageWrite { file: PathBuf, source: io::Error },
    #[error("failed to open serial port {port}: {source}")]
    PortOpen {
        port: String,
        source: serialport::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
