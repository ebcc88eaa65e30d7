//! Lifecycle of one hidden-service endpoint.
//!
//! ```text
//! Init -> ControllerConnect -> Authenticate -> {CreateEphemeral | ResumeFromKeyfile}
//!      -> Published -> Polling -> Teardown -> Done
//! ```
//!
//! Any step before `Published` can fail into `Error`, which posts exactly one
//! `Tor_Proxy_Error` event and ends the run. Teardown failures are reported
//! the same way but still end in `Done`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::crypto::write_secret_file;
use crate::lifecycle::Widget;
use crate::onion::{
    ControlConnector, ControlPort, ControllerError, OnionDescriptor, OnionKey, PortMapping,
};
use crate::transport::{ResultEvent, ResultQueue};

/// Whether the onion address survives restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnionMode {
    /// New address on every start.
    Ephemeral,
    /// Address key kept in `<key_dir>/<name>.key`.
    Persistent { key_dir: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Init,
    ControllerConnect,
    Authenticate,
    CreateEphemeral,
    ResumeFromKeyfile,
    Published,
    Polling,
    Teardown,
    Done,
    Error,
}

/// One endpoint's hidden service. Runs until stopped.
pub struct HiddenService {
    name: String,
    ports: Vec<PortMapping>,
    mode: OnionMode,
    connector: Arc<dyn ControlConnector>,
    queue: ResultQueue,
    poll_interval: Duration,
    running: AtomicBool,
    state: Mutex<ServiceState>,
    descriptor: Mutex<Option<OnionDescriptor>>,
}

impl HiddenService {
    pub fn new(
        name: impl Into<String>,
        ports: Vec<PortMapping>,
        mode: OnionMode,
        connector: Arc<dyn ControlConnector>,
        queue: ResultQueue,
    ) -> Self {
        Self {
            name: name.into(),
            ports,
            mode,
            connector,
            queue,
            poll_interval: Duration::from_secs(1),
            running: AtomicBool::new(true),
            state: Mutex::new(ServiceState::Init),
            descriptor: Mutex::new(None),
        }
    }

    /// How often the poll loop checks for `stop`.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The `.onion` address once published.
    pub fn address(&self) -> Option<String> {
        self.descriptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(OnionDescriptor::address)
    }

    /// Path of the key file in persistent mode.
    pub fn key_path(&self) -> Option<PathBuf> {
        match &self.mode {
            OnionMode::Ephemeral => None,
            OnionMode::Persistent { key_dir } => Some(key_dir.join(format!("{}.key", self.name))),
        }
    }

    fn set_state(&self, state: ServiceState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn report(&self, error: &ControllerError) {
        warn!(name = %self.name, %error, "hidden service error");
        self.queue.push(ResultEvent::ControllerError {
            name: self.name.clone(),
            error: error.to_string(),
        });
    }

    fn publish(&self) -> Result<(Box<dyn ControlPort>, OnionDescriptor), ControllerError> {
        self.set_state(ServiceState::ControllerConnect);
        let mut control = self.connector.connect()?;

        self.set_state(ServiceState::Authenticate);
        control.authenticate()?;

        let descriptor = match self.key_path() {
            None => {
                self.set_state(ServiceState::CreateEphemeral);
                control.create_ephemeral(&self.ports)?
            }
            Some(path) if path.exists() => {
                self.set_state(ServiceState::ResumeFromKeyfile);
                let key = read_key_file(&path)?;
                control.create_from_key(&key, &self.ports)?
            }
            Some(path) => {
                self.set_state(ServiceState::CreateEphemeral);
                let descriptor = control.create_ephemeral(&self.ports)?;
                let saved = descriptor
                    .private_key
                    .as_ref()
                    .ok_or_else(|| ControllerError::KeyFile("controller returned no key".into()))
                    .and_then(|key| write_key_file(&path, key));
                if let Err(e) = saved {
                    // The key is gone; withdraw the address it backs.
                    let _ = control.remove(&descriptor.service_id);
                    return Err(e);
                }
                info!(name = %self.name, path = %path.display(), "onion key saved");
                descriptor
            }
        };
        Ok((control, descriptor))
    }
}

impl Widget for HiddenService {
    fn run(&self) {
        let (mut control, descriptor) = match self.publish() {
            Ok(published) => published,
            Err(e) => {
                self.set_state(ServiceState::Error);
                self.report(&e);
                return;
            }
        };

        let address = descriptor.address();
        let service_id = descriptor.service_id.clone();
        *self.descriptor.lock().unwrap_or_else(PoisonError::into_inner) = Some(descriptor);
        self.set_state(ServiceState::Published);
        info!(name = %self.name, %address, "hidden service published");
        self.queue.push(ResultEvent::ServicePublished {
            name: self.name.clone(),
            address,
        });

        self.set_state(ServiceState::Polling);
        while self.running.load(Ordering::SeqCst) {
            thread::sleep(self.poll_interval);
        }

        self.set_state(ServiceState::Teardown);
        match control.remove(&service_id) {
            Ok(()) => info!(name = %self.name, "hidden service removed"),
            Err(e) => self.report(&e),
        }
        self.set_state(ServiceState::Done);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn read_key_file(path: &Path) -> Result<OnionKey, ControllerError> {
    let text = fs::read_to_string(path)
        .map_err(|e| ControllerError::KeyFile(format!("{}: {}", path.display(), e)))?;
    OnionKey::parse(&text)
}

fn write_key_file(path: &Path, key: &OnionKey) -> Result<(), ControllerError> {
    let write = || -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        write_secret_file(path, key.to_string().as_bytes())
    };

    write().map_err(|e| {
        let _ = fs::remove_file(path);
        ControllerError::KeyFile(format!("{}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{result_queue, ResultReceiver};
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;

    #[derive(Clone, Copy, PartialEq)]
    enum FailAt {
        Nothing,
        Connect,
        Auth,
        Create,
        Remove,
    }

    #[derive(Default)]
    struct Ledger {
        live: Vec<String>,
        removed: Vec<String>,
    }

    /// In-process stand-in for Tor. Service ids are derived from the key, so
    /// the same key always publishes the same address.
    struct FakeTor {
        fail: FailAt,
        ledger: Arc<Mutex<Ledger>>,
    }

    struct FakeControl {
        fail: FailAt,
        ledger: Arc<Mutex<Ledger>>,
    }

    fn service_id_for(key: &str) -> String {
        hex::encode(&Sha256::digest(key.as_bytes())[..16])
    }

    impl ControlConnector for FakeTor {
        fn connect(&self) -> Result<Box<dyn ControlPort>, ControllerError> {
            if self.fail == FailAt::Connect {
                return Err(ControllerError::Connect("connection refused".into()));
            }
            Ok(Box::new(FakeControl {
                fail: self.fail,
                ledger: Arc::clone(&self.ledger),
            }))
        }
    }

    impl FakeControl {
        fn publish(&self, key: OnionKey) -> Result<OnionDescriptor, ControllerError> {
            if self.fail == FailAt::Create {
                return Err(ControllerError::Rejected {
                    code: 512,
                    message: "bad port".into(),
                });
            }
            let service_id = service_id_for(&key.key);
            self.ledger.lock().unwrap().live.push(service_id.clone());
            Ok(OnionDescriptor {
                service_id,
                private_key: Some(key),
            })
        }
    }

    impl ControlPort for FakeControl {
        fn authenticate(&mut self) -> Result<(), ControllerError> {
            if self.fail == FailAt::Auth {
                return Err(ControllerError::Auth("bad cookie".into()));
            }
            Ok(())
        }

        fn create_ephemeral(
            &mut self,
            _: &[PortMapping],
        ) -> Result<OnionDescriptor, ControllerError> {
            let key = OnionKey {
                key_type: "ED25519-V3".into(),
                key: crate::envelope::Nonce::generate().into_string(),
            };
            self.publish(key)
        }

        fn create_from_key(
            &mut self,
            key: &OnionKey,
            _: &[PortMapping],
        ) -> Result<OnionDescriptor, ControllerError> {
            self.publish(key.clone())
        }

        fn remove(&mut self, service_id: &str) -> Result<(), ControllerError> {
            if self.fail == FailAt::Remove {
                return Err(ControllerError::Rejected {
                    code: 552,
                    message: "Unknown Onion Service id".into(),
                });
            }
            let mut ledger = self.ledger.lock().unwrap();
            ledger.live.retain(|id| id != service_id);
            ledger.removed.push(service_id.to_string());
            Ok(())
        }
    }

    struct Harness {
        ledger: Arc<Mutex<Ledger>>,
        rx: ResultReceiver,
        service: Arc<HiddenService>,
        handle: thread::JoinHandle<()>,
    }

    fn launch(fail: FailAt, mode: OnionMode) -> Harness {
        let ledger = Arc::new(Mutex::new(Ledger::default()));
        let connector = Arc::new(FakeTor {
            fail,
            ledger: Arc::clone(&ledger),
        });
        let (queue, rx) = result_queue();
        let service = Arc::new(
            HiddenService::new(
                "Message_Server",
                vec![PortMapping::same_port("127.0.0.1:5002".parse().unwrap())],
                mode,
                connector,
                queue,
            )
            .with_poll_interval(Duration::from_millis(5)),
        );
        let worker = Arc::clone(&service);
        let handle = thread::spawn(move || worker.run());
        Harness {
            ledger,
            rx,
            service,
            handle,
        }
    }

    fn published_address(harness: &mut Harness) -> String {
        match harness.rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            ResultEvent::ServicePublished { name, address } => {
                assert_eq!(name, "Message_Server");
                address
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    fn shut_down(harness: Harness) -> (Arc<Mutex<Ledger>>, ResultReceiver, Arc<HiddenService>) {
        harness.service.stop();
        harness.handle.join().unwrap();
        (harness.ledger, harness.rx, harness.service)
    }

    #[test]
    fn test_ephemeral_publish_and_teardown() {
        let mut harness = launch(FailAt::Nothing, OnionMode::Ephemeral);
        let address = published_address(&mut harness);
        assert!(address.ends_with(".onion"));
        assert_eq!(harness.service.address(), Some(address.clone()));

        let (ledger, mut rx, service) = shut_down(harness);
        assert_eq!(service.state(), ServiceState::Done);
        let ledger = ledger.lock().unwrap();
        assert!(ledger.live.is_empty());
        assert_eq!(ledger.removed, vec![address.trim_end_matches(".onion").to_string()]);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_persistent_address_is_stable() {
        let dir = tempdir().unwrap();
        let mode = OnionMode::Persistent {
            key_dir: dir.path().join("keys"),
        };

        let mut first = launch(FailAt::Nothing, mode.clone());
        let first_address = published_address(&mut first);
        let key_path = first.service.key_path().unwrap();
        shut_down(first);

        let key_text = fs::read_to_string(&key_path).unwrap();
        assert!(key_text.starts_with("ED25519-V3:"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let mut second = launch(FailAt::Nothing, mode.clone());
        assert_eq!(published_address(&mut second), first_address);
        shut_down(second);

        fs::remove_file(&key_path).unwrap();
        let mut third = launch(FailAt::Nothing, mode);
        assert_ne!(published_address(&mut third), first_address);
        shut_down(third);
    }

    #[test]
    fn test_corrupt_key_file_is_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Message_Server.key"), "garbage").unwrap();
        let harness = launch(
            FailAt::Nothing,
            OnionMode::Persistent {
                key_dir: dir.path().to_path_buf(),
            },
        );
        harness.handle.join().unwrap();

        let mut rx = harness.rx;
        assert_eq!(rx.try_recv().unwrap().desc(), "Tor_Proxy_Error");
        assert!(rx.try_recv().is_none());
        assert_eq!(harness.service.state(), ServiceState::Error);
    }

    #[test]
    fn test_each_failure_posts_one_event() {
        for fail in [FailAt::Connect, FailAt::Auth, FailAt::Create] {
            let harness = launch(fail, OnionMode::Ephemeral);
            // Fails before publishing, so run returns without a stop.
            harness.handle.join().unwrap();

            let mut rx = harness.rx;
            let event = rx.try_recv().unwrap();
            assert_eq!(event.desc(), "Tor_Proxy_Error");
            assert_eq!(event.to_json()["name"], "Message_Server");
            assert!(rx.try_recv().is_none());
            assert_eq!(harness.service.state(), ServiceState::Error);
            assert_eq!(harness.service.address(), None);
        }
    }

    #[test]
    fn test_failed_create_writes_no_key_file() {
        let dir = tempdir().unwrap();
        let harness = launch(
            FailAt::Create,
            OnionMode::Persistent {
                key_dir: dir.path().to_path_buf(),
            },
        );
        harness.handle.join().unwrap();
        assert!(!harness.service.key_path().unwrap().exists());
    }

    #[test]
    fn test_teardown_failure_reported_and_done() {
        let mut harness = launch(FailAt::Remove, OnionMode::Ephemeral);
        published_address(&mut harness);

        let (_, mut rx, service) = shut_down(harness);
        assert_eq!(rx.try_recv().unwrap().desc(), "Tor_Proxy_Error");
        assert_eq!(service.state(), ServiceState::Done);
    }

    #[test]
    fn test_stop_before_run_still_tears_down() {
        let ledger = Arc::new(Mutex::new(Ledger::default()));
        let (queue, mut rx) = result_queue();
        let service = HiddenService::new(
            "Message_Server",
            Vec::new(),
            OnionMode::Ephemeral,
            Arc::new(FakeTor {
                fail: FailAt::Nothing,
                ledger: Arc::clone(&ledger),
            }),
            queue,
        );
        service.stop();
        service.run();

        assert!(matches!(
            rx.try_recv(),
            Some(ResultEvent::ServicePublished { .. })
        ));
        assert!(ledger.lock().unwrap().live.is_empty());
        assert_eq!(service.state(), ServiceState::Done);
    }
}
