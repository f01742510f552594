use std::{ffi::CString, fs, io, os::unix::ffi::OsStrExt, path::Path};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::{
    address::{self, NodeAddress, PrefixGenerator},
    config::BootstrapConfig,
    daemon::Daemon,
    error::{BootstrapError, DataplaneError},
    identity::{self, NodeIdentity},
    loader::{Loader, LoaderInvocation},
    node_config,
    server::Service,
    table::{MapHandle, MapOpener},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Init,
    AddressResolved,
    IdentityDerived,
    ConfigWritten,
    LoaderInvoked,
    MapOpened,
    DaemonConstructed,
    Serving,
    Stopped,
}

/// External mechanisms the bootstrap sequence drives.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub prefixes: &'a dyn PrefixGenerator,
    pub loader: &'a dyn Loader,
    pub maps: &'a dyn MapOpener,
}

/// Outcome of the dataplane portion of bootstrap. `table` is `None` when the
/// node runs degraded.
pub struct Dataplane {
    pub address: NodeAddress,
    pub identity: NodeIdentity,
    pub table: Option<MapHandle>,
}

/// Single-pass bootstrap of one agent process.
///
/// Address resolution, the runtime directory check and server construction
/// are fatal. Config write, loader and map open failures only disable the
/// dataplane; the control socket still comes up.
pub struct Bootstrap<'a> {
    config: &'a BootstrapConfig,
    collaborators: Collaborators<'a>,
    stage: Stage,
}

impl<'a> Bootstrap<'a> {
    pub fn new(config: &'a BootstrapConfig, collaborators: Collaborators<'a>) -> Self {
        Self {
            config,
            collaborators,
            stage: Stage::Init,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self, next: Stage) {
        debug!(from = ?self.stage, to = ?next, "bootstrap stage");
        self.stage = next;
    }

    pub async fn init_dataplane(&mut self, node_addr: &str) -> Result<Dataplane, BootstrapError> {
        let address = address::resolve(node_addr, self.collaborators.prefixes)?;
        info!(addr = %address, network = %address.network(), "node address resolved");
        self.advance(Stage::AddressResolved);

        let identity = identity::derive(&address);
        self.advance(Stage::IdentityDerived);

        check_run_dir(&self.config.run_dir)?;

        let table = match self.load_dataplane(&address, &identity).await {
            Ok(table) => Some(table),
            Err(err) => {
                warn!(stage = ?self.stage, error = %err, "dataplane unavailable, continuing without it");
                if let Some(output) = err.output() {
                    warn!("loader output:\n{}", String::from_utf8_lossy(output));
                }
                None
            }
        };

        Ok(Dataplane {
            address,
            identity,
            table,
        })
    }

    async fn load_dataplane(
        &mut self,
        address: &NodeAddress,
        identity: &NodeIdentity,
    ) -> Result<MapHandle, DataplaneError> {
        let path = node_config::node_config_path(&self.config.run_dir);
        node_config::write(&path, self.config, address, identity)?;
        debug!(path = %path.display(), node_id = identity.node_id, "node configuration written");
        self.advance(Stage::ConfigWritten);

        let invocation = LoaderInvocation::new(
            &self.config.lib_dir,
            address,
            self.config.device.as_deref(),
        );
        let output = self.collaborators.loader.invoke(&invocation).await?;
        debug!(mode = ?invocation.mode, "loader finished:\n{}", String::from_utf8_lossy(&output));
        self.advance(Stage::LoaderInvoked);

        let table = self.collaborators.maps.open()?;
        self.advance(Stage::MapOpened);
        Ok(table)
    }

    /// Builds the daemon and its server, then serves until `shutdown`
    /// resolves or the server returns. The server is stopped exactly once on
    /// every way out of this function, unwinding included.
    pub async fn serve<S, F, Fut>(
        &mut self,
        dataplane: Dataplane,
        bind: F,
        shutdown: Fut,
    ) -> Result<()>
    where
        S: Service,
        F: FnOnce(&Path, Daemon) -> Result<S, BootstrapError>,
        Fut: Future<Output = ()>,
    {
        info!(
            addr = %dataplane.address,
            node_id = dataplane.identity.node_id,
            dataplane = dataplane.table.is_some(),
            "starting daemon"
        );
        let daemon = Daemon::new(&self.config.lib_dir, dataplane.table.clone());
        let service = bind(&self.config.socket_path, daemon)?;
        self.advance(Stage::DaemonConstructed);

        let result = {
            let _release = StopOnExit(&service);
            self.advance(Stage::Serving);
            tokio::select! {
                res = service.start() => res,
                () = shutdown => {
                    info!("shutdown requested");
                    Ok(())
                }
            }
        };
        self.advance(Stage::Stopped);
        result
    }
}

/// The runtime directory must be a directory we could change into, which
/// takes search permission rather than read permission.
fn check_run_dir(path: &Path) -> Result<(), BootstrapError> {
    searchable_dir(path).map_err(|source| BootstrapError::RuntimeDirUnavailable {
        path: path.to_path_buf(),
        source,
    })
}

fn searchable_dir(path: &Path) -> io::Result<()> {
    if !fs::metadata(path)?.is_dir() {
        return Err(io::Error::from(io::ErrorKind::NotADirectory));
    }
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    if unsafe { libc::access(c_path.as_ptr(), libc::X_OK) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct StopOnExit<'s, S: Service>(&'s S);

impl<S: Service> Drop for StopOnExit<'_, S> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future,
        os::unix::fs::PermissionsExt,
        path::PathBuf,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    use anyhow::anyhow;
    use async_trait::async_trait;

    use super::*;
    use crate::{config::LogLevel, daemon::tests::MemoryMap, node_config::node_config_path};

    struct NoPrefix;

    impl PrefixGenerator for NoPrefix {
        fn generate(&self) -> Result<String, BootstrapError> {
            Err(BootstrapError::PrefixGeneration("not in tests".into()))
        }
    }

    #[derive(Default)]
    struct FakeLoader {
        fail: bool,
        calls: Mutex<Vec<LoaderInvocation>>,
    }

    #[async_trait]
    impl Loader for FakeLoader {
        async fn invoke(&self, invocation: &LoaderInvocation) -> Result<Vec<u8>, DataplaneError> {
            self.calls.lock().unwrap().push(invocation.clone());
            if self.fail {
                Err(DataplaneError::LoaderFailed {
                    program: PathBuf::from("init.sh"),
                    status: "exit status: 1".into(),
                    output: b"clang: not found\n".to_vec(),
                })
            } else {
                Ok(b"ok\n".to_vec())
            }
        }
    }

    #[derive(Default)]
    struct FakeMaps {
        fail: bool,
        calls: AtomicUsize,
    }

    impl MapOpener for FakeMaps {
        fn open(&self) -> Result<MapHandle, DataplaneError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DataplaneError::MapOpen {
                    pin: PathBuf::from("/sys/fs/bpf/tc/globals/dataplane_endpoints"),
                    reason: "No such file or directory".into(),
                })
            } else {
                Ok(Arc::new(MemoryMap::default()))
            }
        }
    }

    enum Behavior {
        ServeForever,
        Fail,
        Panic,
    }

    struct FakeService {
        behavior: Behavior,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Service for FakeService {
        async fn start(&self) -> Result<()> {
            match self.behavior {
                Behavior::ServeForever => future::pending().await,
                Behavior::Fail => Err(anyhow!("listener closed")),
                Behavior::Panic => panic!("handler bug"),
            }
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        _run: tempfile::TempDir,
        config: BootstrapConfig,
        loader: FakeLoader,
        maps: FakeMaps,
    }

    impl Harness {
        fn new(device: &str) -> Self {
            let run = tempfile::tempdir().unwrap();
            fs::create_dir(run.path().join("globals")).unwrap();
            let config = BootstrapConfig::new(
                PathBuf::from("/tmp/lib"),
                run.path().to_path_buf(),
                run.path().join("agent.sock"),
                device,
                LogLevel::Info,
            );
            Self {
                _run: run,
                config,
                loader: FakeLoader::default(),
                maps: FakeMaps::default(),
            }
        }

        fn collaborators(&self) -> Collaborators<'_> {
            Collaborators {
                prefixes: &NoPrefix,
                loader: &self.loader,
                maps: &self.maps,
            }
        }

        fn config_file(&self) -> PathBuf {
            node_config_path(&self.config.run_dir)
        }
    }

    fn service(behavior: Behavior, stops: &Arc<AtomicUsize>) -> FakeService {
        FakeService {
            behavior,
            stops: stops.clone(),
        }
    }

    #[tokio::test]
    async fn full_dataplane_reaches_map_opened() {
        let h = Harness::new("eth0");
        let mut bootstrap = Bootstrap::new(&h.config, h.collaborators());

        let dataplane = bootstrap.init_dataplane("2001:db8::1").await.unwrap();

        assert_eq!(bootstrap.stage(), Stage::MapOpened);
        assert!(dataplane.table.is_some());
        assert_eq!(dataplane.address.network().to_string(), "2001:db8::/64");
        assert!(h.config_file().exists());
        let calls = h.loader.calls.lock().unwrap();
        assert_eq!(
            calls[0].args(),
            vec!["/tmp/lib", "2001:db8::1", "direct", "eth0"]
        );
        assert_eq!(h.maps.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_address_stops_before_any_side_effect() {
        let h = Harness::new("undefined");
        for value in ["2001:db8::zz", "fe80::1"] {
            let mut bootstrap = Bootstrap::new(&h.config, h.collaborators());
            assert!(bootstrap.init_dataplane(value).await.is_err());
            assert_eq!(bootstrap.stage(), Stage::Init);
        }
        assert!(!h.config_file().exists());
        assert!(h.loader.calls.lock().unwrap().is_empty());
        assert_eq!(h.maps.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_run_dir_is_fatal() {
        let mut h = Harness::new("undefined");
        h.config.run_dir = h.config.run_dir.join("missing");
        let mut bootstrap = Bootstrap::new(&h.config, h.collaborators());
        let result = bootstrap.init_dataplane("2001:db8::1").await;
        assert!(matches!(
            result,
            Err(BootstrapError::RuntimeDirUnavailable { .. })
        ));
        assert!(h.loader.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn run_dir_needs_search_not_read_permission() {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path().join("run");
        fs::create_dir(&run).unwrap();

        fs::set_permissions(&run, fs::Permissions::from_mode(0o311)).unwrap();
        assert!(check_run_dir(&run).is_ok());

        fs::set_permissions(&run, fs::Permissions::from_mode(0o600)).unwrap();
        let unprivileged = unsafe { libc::geteuid() } != 0;
        if unprivileged {
            assert!(matches!(
                check_run_dir(&run),
                Err(BootstrapError::RuntimeDirUnavailable { .. })
            ));
        }
        fs::set_permissions(&run, fs::Permissions::from_mode(0o700)).unwrap();
    }

    #[test]
    fn plain_file_is_not_a_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("run");
        fs::write(&file, b"").unwrap();
        assert!(matches!(
            check_run_dir(&file),
            Err(BootstrapError::RuntimeDirUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn config_write_failure_skips_loader() {
        let h = Harness::new("undefined");
        fs::remove_dir(h.config.run_dir.join("globals")).unwrap();
        let mut bootstrap = Bootstrap::new(&h.config, h.collaborators());

        let dataplane = bootstrap.init_dataplane("2001:db8::1").await.unwrap();

        assert!(dataplane.table.is_none());
        assert_eq!(bootstrap.stage(), Stage::IdentityDerived);
        assert!(h.loader.calls.lock().unwrap().is_empty());
        assert_eq!(h.maps.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn loader_failure_skips_map_open() {
        let mut h = Harness::new("undefined");
        h.loader.fail = true;
        let mut bootstrap = Bootstrap::new(&h.config, h.collaborators());

        let dataplane = bootstrap.init_dataplane("2001:db8::1").await.unwrap();

        assert!(dataplane.table.is_none());
        assert_eq!(bootstrap.stage(), Stage::ConfigWritten);
        assert_eq!(
            h.loader.calls.lock().unwrap()[0].args(),
            vec!["/tmp/lib", "2001:db8::1", "vxlan"]
        );
        assert_eq!(h.maps.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn degraded_dataplane_still_serves() {
        let cases = [(true, false, false), (false, true, false), (false, false, true)];
        for (config_fails, loader_fails, map_fails) in cases {
            let mut h = Harness::new("undefined");
            if config_fails {
                fs::remove_dir(h.config.run_dir.join("globals")).unwrap();
            }
            h.loader.fail = loader_fails;
            h.maps.fail = map_fails;
            let mut bootstrap = Bootstrap::new(&h.config, h.collaborators());
            let dataplane = bootstrap.init_dataplane("2001:db8::1").await.unwrap();

            let stops = Arc::new(AtomicUsize::new(0));
            let ready = Arc::new(AtomicBool::new(true));
            let bound_at = Mutex::new(None);
            bootstrap
                .serve(
                    dataplane,
                    |path, daemon| {
                        ready.store(daemon.dataplane_ready(), Ordering::SeqCst);
                        *bound_at.lock().unwrap() = Some(path.to_path_buf());
                        Ok(service(Behavior::ServeForever, &stops))
                    },
                    async {},
                )
                .await
                .unwrap();

            assert!(!ready.load(Ordering::SeqCst));
            assert_eq!(bound_at.lock().unwrap().as_deref(), Some(h.config.socket_path.as_path()));
            assert_eq!(bootstrap.stage(), Stage::Stopped);
            assert_eq!(stops.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn start_error_still_stops_once() {
        let h = Harness::new("undefined");
        let mut bootstrap = Bootstrap::new(&h.config, h.collaborators());
        let dataplane = bootstrap.init_dataplane("2001:db8::1").await.unwrap();
        let stops = Arc::new(AtomicUsize::new(0));

        let result = bootstrap
            .serve(
                dataplane,
                |_, _| Ok(service(Behavior::Fail, &stops)),
                future::pending::<()>(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(bootstrap.stage(), Stage::Stopped);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_construction_failure_is_fatal() {
        let h = Harness::new("undefined");
        let mut bootstrap = Bootstrap::new(&h.config, h.collaborators());
        let dataplane = bootstrap.init_dataplane("2001:db8::1").await.unwrap();
        let stops = Arc::new(AtomicUsize::new(0));

        let err = bootstrap
            .serve(
                dataplane,
                |path, _| -> Result<FakeService, BootstrapError> {
                    Err(BootstrapError::Server {
                        path: path.to_path_buf(),
                        source: io::Error::from(io::ErrorKind::AddrInUse),
                    })
                },
                async {},
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::Server { .. })
        ));
        assert_eq!(bootstrap.stage(), Stage::MapOpened);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panic_while_serving_still_stops_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let task_stops = stops.clone();

        let joined = tokio::spawn(async move {
            let h = Harness::new("undefined");
            let mut bootstrap = Bootstrap::new(&h.config, h.collaborators());
            let dataplane = bootstrap.init_dataplane("2001:db8::1").await.unwrap();
            bootstrap
                .serve(
                    dataplane,
                    |_, _| Ok(service(Behavior::Panic, &task_stops)),
                    future::pending::<()>(),
                )
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
