use std::{
    fmt::Write as _,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::{
    address::NodeAddress, config::BootstrapConfig, error::DataplaneError, identity::NodeIdentity,
};

/// Artifact location relative to the runtime directory.
pub const NODE_CONFIG_PATH: &str = "globals/node_config.h";

pub fn node_config_path(run_dir: &Path) -> PathBuf {
    run_dir.join(NODE_CONFIG_PATH)
}

/// Renders the header consumed by the dataplane loader.
pub fn render(cfg: &BootstrapConfig, addr: &NodeAddress, id: &NodeIdentity) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write!(
        out,
        "/*\n * Node MAC: {}\n * Node IP: {}\n */\n\n",
        id.mac, addr
    );
    if cfg.debug {
        out.push_str("#define DEBUG\n");
    }
    let _ = writeln!(out, "#define NODE_ID {:#x}", id.node_id);
    out.push_str(&define_address("NODE_MAC", &id.mac.octets()));
    out.push_str(&define_array("ROUTER_IP", &addr.addr().octets()));
    out
}

fn define_address(name: &str, bytes: &[u8]) -> String {
    format!("#define {name} {{ .addr = {{ {} }} }}\n", c_array(bytes))
}

fn define_array(name: &str, bytes: &[u8]) -> String {
    format!("#define {name} {{ {} }}\n", c_array(bytes))
}

fn c_array(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:#04x}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Replaces the artifact at `path`.
///
/// The content goes to a sibling file that is synced and renamed over the
/// target, so readers see either the old artifact or the complete new one.
pub fn write(
    path: &Path,
    cfg: &BootstrapConfig,
    addr: &NodeAddress,
    id: &NodeIdentity,
) -> Result<(), DataplaneError> {
    let content = render(cfg, addr, id);
    write_replace(path, content.as_bytes()).map_err(|source| DataplaneError::ConfigWrite {
        path: path.to_path_buf(),
        source,
    })
}

fn write_replace(path: &Path, content: &[u8]) -> io::Result<()> {
    let staging = staging_path(path);
    let result = (|| {
        let mut file = File::create(&staging)?;
        file.write_all(content)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&staging, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
