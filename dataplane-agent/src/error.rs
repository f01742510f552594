use std::{io, path::PathBuf};

use thiserror::Error;

/// Failures that leave no usable node: the process logs them and exits.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("unable to generate IPv6 prefix: {0}")]
    PrefixGeneration(String),
    #[error("invalid node address \"{value}\", please specify node address using -n")]
    InvalidAddressFormat { value: String },
    #[error("invalid node address: {value}")]
    InvalidNodeAddress { value: String },
    #[error("invalid CIDR {value}/64: {reason}")]
    InvalidNetworkPrefix { value: String, reason: String },
    #[error("could not change to runtime directory {}: {source}", .path.display())]
    RuntimeDirUnavailable { path: PathBuf, source: io::Error },
    #[error("error while creating server on {}: {source}", .path.display())]
    Server { path: PathBuf, source: io::Error },
}

/// Failures of the dataplane portion of bootstrap. These degrade the node to
/// control-plane only operation instead of stopping it.
#[derive(Debug, Error)]
pub enum DataplaneError {
    #[error("failed to create node configuration file {}: {source}", .path.display())]
    ConfigWrite { path: PathBuf, source: io::Error },
    #[error("failed to execute loader {}: {source}", .program.display())]
    LoaderSpawn { program: PathBuf, source: io::Error },
    #[error("loader {} exited with {status}", .program.display())]
    LoaderFailed {
        program: PathBuf,
        status: String,
        output: Vec<u8>,
    },
    #[error("could not open forwarding table '{}': {reason}", .pin.display())]
    MapOpen { pin: PathBuf, reason: String },
}

impl DataplaneError {
    /// Captured loader output, when the failure came from a finished run.
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            DataplaneError::LoaderFailed { output, .. } => Some(output.as_slice()),
            _ => None,
        }
    }
}

/// Per-request failures of forwarding table operations.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("dataplane is not available")]
    Unavailable,
    #[error("endpoint {0} not found")]
    NotFound(u32),
    #[error("forwarding table operation failed: {0}")]
    Map(String),
}
