use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use aya::maps::{HashMap as AyaHashMap, Map, MapData, MapError};

use dataplane_agent_common::{ENDPOINT_MAP_PIN, EndpointInfo, EndpointKey};

use crate::error::{DataplaneError, TableError};

/// Shared handle to the kernel-resident forwarding table. Holders read and
/// write entries; closing the table is left to whoever dropped the last handle.
pub type MapHandle = Arc<dyn EndpointMap>;

pub trait EndpointMap: Send + Sync {
    fn lookup(&self, id: u32) -> Result<EndpointInfo, TableError>;
    fn update(&self, id: u32, info: EndpointInfo) -> Result<(), TableError>;
    fn delete(&self, id: u32) -> Result<(), TableError>;
}

pub trait MapOpener: Send + Sync {
    fn open(&self) -> Result<MapHandle, DataplaneError>;
}

/// Opens the forwarding table pinned by the loader.
#[derive(Clone, Debug)]
pub struct PinnedMapOpener {
    pin: PathBuf,
}

impl PinnedMapOpener {
    pub fn new<P: AsRef<Path>>(pin: P) -> Self {
        Self {
            pin: pin.as_ref().to_path_buf(),
        }
    }
}

impl Default for PinnedMapOpener {
    fn default() -> Self {
        Self::new(ENDPOINT_MAP_PIN)
    }
}

impl MapOpener for PinnedMapOpener {
    fn open(&self) -> Result<MapHandle, DataplaneError> {
        let map_open = |reason: String| DataplaneError::MapOpen {
            pin: self.pin.clone(),
            reason,
        };
        let map_data = MapData::from_pin(&self.pin)
            .map_err(|e| map_open(format!("failed to open pinned map: {e}")))?;
        // The pin is a plain hash map; key and value sizes are checked on conversion.
        let table =
            AyaHashMap::<MapData, EndpointKey, EndpointInfo>::try_from(Map::HashMap(map_data))
                .map_err(|e| map_open(format!("failed to convert to HashMap: {e}")))?;
        Ok(Arc::new(PinnedEndpointMap {
            inner: Mutex::new(table),
        }))
    }
}

struct PinnedEndpointMap {
    inner: Mutex<AyaHashMap<MapData, EndpointKey, EndpointInfo>>,
}

impl PinnedEndpointMap {
    fn with_table<T>(
        &self,
        f: impl FnOnce(&mut AyaHashMap<MapData, EndpointKey, EndpointInfo>) -> Result<T, MapError>,
    ) -> Result<T, MapError> {
        let mut guard = self.inner.lock().expect("forwarding table mutex poisoned");
        f(&mut guard)
    }
}

impl EndpointMap for PinnedEndpointMap {
    fn lookup(&self, id: u32) -> Result<EndpointInfo, TableError> {
        self.with_table(|table| table.get(&EndpointKey { id }, 0))
            .map_err(|e| table_error(id, e))
    }

    fn update(&self, id: u32, info: EndpointInfo) -> Result<(), TableError> {
        self.with_table(|table| table.insert(EndpointKey { id }, info, 0))
            .map_err(|e| table_error(id, e))
    }

    fn delete(&self, id: u32) -> Result<(), TableError> {
        self.with_table(|table| table.remove(&EndpointKey { id }))
            .map_err(|e| table_error(id, e))
    }
}

fn table_error(id: u32, err: MapError) -> TableError {
    match err {
        MapError::KeyNotFound => TableError::NotFound(id),
        other => TableError::Map(other.to_string()),
    }
}
