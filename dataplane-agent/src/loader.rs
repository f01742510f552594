use std::{
    ffi::OsString,
    io,
    os::fd::OwnedFd,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::{io::AsyncReadExt, net::unix::pipe, process::Command};

use crate::{address::NodeAddress, error::DataplaneError};

pub const LOADER_SCRIPT: &str = "init.sh";

/// Encapsulation strategy selected for the dataplane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoaderMode {
    Vxlan,
    Direct { device: String },
}

/// Positional arguments handed to the loader.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoaderInvocation {
    pub lib_dir: PathBuf,
    pub node_addr: String,
    pub mode: LoaderMode,
}

impl LoaderInvocation {
    pub fn new(lib_dir: &Path, addr: &NodeAddress, device: Option<&str>) -> Self {
        let mode = match device {
            Some(device) => LoaderMode::Direct {
                device: device.to_string(),
            },
            None => LoaderMode::Vxlan,
        };
        Self {
            lib_dir: lib_dir.to_path_buf(),
            node_addr: addr.to_string(),
            mode,
        }
    }

    pub fn args(&self) -> Vec<OsString> {
        let mut args = vec![
            self.lib_dir.clone().into_os_string(),
            OsString::from(&self.node_addr),
        ];
        match &self.mode {
            LoaderMode::Vxlan => args.push("vxlan".into()),
            LoaderMode::Direct { device } => {
                args.push("direct".into());
                args.push(device.into());
            }
        }
        args
    }
}

/// Installs the dataplane program. Returns the captured output on success.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn invoke(&self, invocation: &LoaderInvocation) -> Result<Vec<u8>, DataplaneError>;
}

/// Runs `<lib_dir>/init.sh` from inside the runtime directory.
#[derive(Clone, Debug)]
pub struct ScriptLoader {
    program: PathBuf,
    run_dir: PathBuf,
}

impl ScriptLoader {
    pub fn new(lib_dir: &Path, run_dir: &Path) -> Self {
        Self {
            program: lib_dir.join(LOADER_SCRIPT),
            run_dir: run_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl Loader for ScriptLoader {
    // TODO: bound the wait once a timeout policy for the loader is agreed on.
    async fn invoke(&self, invocation: &LoaderInvocation) -> Result<Vec<u8>, DataplaneError> {
        let spawn_error = |source: io::Error| DataplaneError::LoaderSpawn {
            program: self.program.clone(),
            source,
        };

        // stdout and stderr share one pipe so the output keeps its write order.
        let (reader, writer) = io::pipe().map_err(spawn_error)?;
        let stderr = writer.try_clone().map_err(spawn_error)?;
        let mut output =
            pipe::Receiver::from_owned_fd(OwnedFd::from(reader)).map_err(spawn_error)?;

        let mut command = Command::new(&self.program);
        command
            .args(invocation.args())
            .current_dir(&self.run_dir)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr);
        let mut child = command.spawn().map_err(spawn_error)?;
        // The command still holds the write ends; EOF needs them closed.
        drop(command);

        let mut combined = Vec::new();
        output
            .read_to_end(&mut combined)
            .await
            .map_err(spawn_error)?;
        let status = child.wait().await.map_err(spawn_error)?;

        if status.success() {
            Ok(combined)
        } else {
            Err(DataplaneError::LoaderFailed {
                program: self.program.clone(),
                status: status.to_string(),
                output: combined,
            })
        }
    }
}
