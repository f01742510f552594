use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use dataplane_agent_common::EndpointInfo;

use crate::{
    error::TableError,
    table::{EndpointMap, MapHandle},
};

/// Wire form of a forwarding table entry.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ifindex: u32,
    pub node_id: u32,
    pub mac: [u8; 6],
    pub ip6: [u8; 16],
}

impl From<EndpointInfo> for Endpoint {
    fn from(info: EndpointInfo) -> Self {
        Self {
            ifindex: info.ifindex,
            node_id: info.node_id,
            mac: info.mac,
            ip6: info.ip6,
        }
    }
}

impl From<&Endpoint> for EndpointInfo {
    fn from(ep: &Endpoint) -> Self {
        Self {
            ifindex: ep.ifindex,
            node_id: ep.node_id,
            mac: ep.mac,
            pad: [0; 2],
            ip6: ep.ip6,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Status,
    EndpointGet { id: u32 },
    EndpointPut { id: u32, endpoint: Endpoint },
    EndpointDelete { id: u32 },
}

/// Request handler behind the control socket.
///
/// The forwarding table is optional: without it the daemon keeps serving the
/// control-plane requests and fails the dataplane ones.
pub struct Daemon {
    lib_dir: PathBuf,
    table: Option<MapHandle>,
}

impl Daemon {
    pub fn new(lib_dir: &Path, table: Option<MapHandle>) -> Self {
        Self {
            lib_dir: lib_dir.to_path_buf(),
            table,
        }
    }

    pub fn dataplane_ready(&self) -> bool {
        self.table.is_some()
    }

    fn table(&self) -> Result<&dyn EndpointMap, TableError> {
        self.table.as_deref().ok_or(TableError::Unavailable)
    }

    pub fn handle(&self, request: Request) -> Result<Value, TableError> {
        match request {
            Request::Ping => Ok(json!("pong")),
            Request::Status => Ok(json!({
                "lib_dir": self.lib_dir.display().to_string(),
                "dataplane": self.dataplane_ready(),
            })),
            Request::EndpointGet { id } => {
                let info = self.table()?.lookup(id)?;
                Ok(json!(Endpoint::from(info)))
            }
            Request::EndpointPut { id, endpoint } => {
                self.table()?.update(id, EndpointInfo::from(&endpoint))?;
                Ok(Value::Null)
            }
            Request::EndpointDelete { id } => {
                self.table()?.delete(id)?;
                Ok(Value::Null)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use super::*;

    #[derive(Default)]
    pub(crate) struct MemoryMap {
        entries: Mutex<HashMap<u32, EndpointInfo>>,
    }

    impl EndpointMap for MemoryMap {
        fn lookup(&self, id: u32) -> Result<EndpointInfo, TableError> {
            let guard = self.entries.lock().unwrap();
            guard.get(&id).copied().ok_or(TableError::NotFound(id))
        }

        fn update(&self, id: u32, info: EndpointInfo) -> Result<(), TableError> {
            self.entries.lock().unwrap().insert(id, info);
            Ok(())
        }

        fn delete(&self, id: u32) -> Result<(), TableError> {
            self.entries
                .lock()
                .unwrap()
                .remove(&id)
                .map(|_| ())
                .ok_or(TableError::NotFound(id))
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint {
            ifindex: 12,
            node_id: 0xc0a8_210b,
            mac: [2, 0, 0, 0, 0, 1],
            ip6: [0xbe, 0xef, 0, 0, 0, 0, 0, 0, 0xc0, 0xa8, 0x21, 0x0b, 0, 0, 0, 9],
        }
    }

    #[test]
    fn requests_decode_from_json() {
        let req: Request = serde_json::from_str(r#"{"op":"endpoint_get","id":4}"#).unwrap();
        assert_eq!(req, Request::EndpointGet { id: 4 });
        let req: Request = serde_json::from_str(r#"{"op":"status"}"#).unwrap();
        assert_eq!(req, Request::Status);
    }

    #[test]
    fn degraded_daemon_serves_control_plane_only() {
        let daemon = Daemon::new(Path::new("/tmp/lib"), None);
        assert_eq!(daemon.handle(Request::Ping).unwrap(), json!("pong"));
        let status = daemon.handle(Request::Status).unwrap();
        assert_eq!(status["dataplane"], json!(false));
        assert!(matches!(
            daemon.handle(Request::EndpointGet { id: 1 }),
            Err(TableError::Unavailable)
        ));
        assert!(matches!(
            daemon.handle(Request::EndpointDelete { id: 1 }),
            Err(TableError::Unavailable)
        ));
    }

    #[test]
    fn endpoints_flow_through_the_table() {
        let table = Arc::new(MemoryMap::default());
        let handle: MapHandle = table.clone();
        let daemon = Daemon::new(Path::new("/tmp/lib"), Some(handle));
        assert!(daemon.dataplane_ready());

        daemon
            .handle(Request::EndpointPut {
                id: 9,
                endpoint: endpoint(),
            })
            .unwrap();
        assert_eq!(table.lookup(9).unwrap().ifindex, 12);

        let fetched = daemon.handle(Request::EndpointGet { id: 9 }).unwrap();
        assert_eq!(serde_json::from_value::<Endpoint>(fetched).unwrap(), endpoint());

        daemon.handle(Request::EndpointDelete { id: 9 }).unwrap();
        assert!(matches!(
            daemon.handle(Request::EndpointGet { id: 9 }),
            Err(TableError::NotFound(9))
        ));
    }
}
