//! Enclave clients and the manager that owns them
//!
//! An `EnclaveClient` is the host's handle on one loaded enclave. It exposes
//! exactly what the fork engine and the signal relay need on top of plain
//! entry: base address, execution state and process identity. Backends
//! implement `EnclaveLoader` to produce clients.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use edge::alloc::BoundaryParams;
use edge::bridge::signal::EnclaveSignal;
use edge::config::EnclaveConfig;
use edge::ecall::{CallID, EnclaveEntry};
use edge::message::{MessageReader, MessageWriter};
use edge::ocall::HostExit;
use edge::snapshot::{ForkHandshakeConfig, SnapshotLayout};
use log::{debug, info, warn};

use crate::Error;

/// How an enclave executes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Hardware isolation: signals always cross the boundary
    Hardware,
    /// Simulation or debug: signals may take a direct path
    Simulation,
}

/// Placement of an enclave reloaded in a forked child
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ForkConfig {
    pub base_address: usize,
    pub enclave_size: usize,
}

/// Everything needed to (re)load one enclave
#[derive(Clone, Debug)]
pub struct LoadConfig {
    pub name:           String,
    pub enclave_size:   usize,
    /// Preferred base address, the backend picks one when None
    pub base_address:   Option<usize>,
    pub mode:           ExecutionMode,
    /// Set only when reloading in a forked child
    pub fork_config:    Option<ForkConfig>,
    pub enclave_config: EnclaveConfig,
}

impl LoadConfig {
    pub fn new(name: &str, enclave_size: usize) -> Self {
        Self{name:           name.to_string(),
             enclave_size:   enclave_size,
             base_address:   None,
             mode:           ExecutionMode::Simulation,
             fork_config:    None,
             enclave_config: EnclaveConfig::default()}
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_config(mut self, config: EnclaveConfig) -> Self {
        self.enclave_config = config;
        self
    }
}

/// Cross into `entry` with `input`, returning the decoded result
///
/// The input buffer is freed here if the callee left it in place. The
/// result buffer is always taken and freed here.

pub(crate) fn cross(entry: &dyn EnclaveEntry,
                    selector: u64,
                    input: &MessageWriter)
                    -> Result<MessageReader, Error> {

    let mut params = BoundaryParams::from_writer(input)?;
    let status = entry.enter(selector, &mut params);
    params.input = None;

    let mut output = params.take_output()?;
    if !status.is_ok() {
        return Err(Error::decode(status, &mut output));
    }
    Ok(output)
}

/// Host handle on a loaded enclave
pub trait EnclaveClient: Send + Sync {

    fn name(&self) -> &str;

    /// Start of the enclave's address range
    fn base_address(&self) -> usize;

    fn enclave_size(&self) -> usize;

    fn execution_mode(&self) -> ExecutionMode;

    /// True while the calling thread is executing inside this enclave
    fn is_execution_active(&self) -> bool;

    /// Adopt the calling process as the enclave's owner after a fork
    fn set_process_id(&self);

    /// Release the enclave's resources. Later entries fail.
    fn release(&self) -> Result<(), Error>;

    /// Enter the enclave at `selector`
    ///
    /// # Inputs
    /// * 'selector' is an entry selector
    /// * 'input' holds the serialized arguments
    ///
    /// # Returns
    ///
    /// The decoded result, or the error the enclave reported

    fn enter(&self, selector: u64, input: &MessageWriter) -> Result<MessageReader, Error>;

    fn enter_and_initialize(&self, config: &EnclaveConfig) -> Result<(), Error> {
        let mut input = MessageWriter::new();
        input.push_str(self.name());
        config.encode(&mut input);
        self.enter(CallID::as_u64(CallID::Initialize), &input)?;
        Ok(())
    }

    fn enter_and_run(&self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut writer = MessageWriter::new();
        writer.push_bytes(input);
        let mut output = self.enter(CallID::as_u64(CallID::Run), &writer)?;
        if !output.has_next() {
            return Ok(Vec::new());
        }
        output.next_bytes()
    }

    fn enter_and_finalize(&self, input: &[u8]) -> Result<(), Error> {
        let mut writer = MessageWriter::new();
        writer.push_bytes(input);
        self.enter(CallID::as_u64(CallID::Finalize), &writer)?;
        Ok(())
    }

    /// Deliver a signal, returning the enclave's result code
    fn enter_and_handle_signal(&self, signal: &EnclaveSignal) -> Result<i32, Error> {
        let mut writer = MessageWriter::new();
        signal.encode(&mut writer);
        let mut output = self.enter(CallID::as_u64(CallID::DeliverSignal), &writer)?;
        output.next::<i32>()
    }

    fn enter_and_take_snapshot(&self) -> Result<SnapshotLayout, Error> {
        let mut output = self.enter(CallID::as_u64(CallID::TakeSnapshot), &MessageWriter::new())?;
        /* The enclave hands over the buffers it allocated for this call */
        unsafe { SnapshotLayout::from_message(&mut output) }
    }

    fn enter_and_restore(&self, snapshot: &SnapshotLayout) -> Result<(), Error> {
        let mut writer = MessageWriter::new();
        snapshot.lend(&mut writer);
        self.enter(CallID::as_u64(CallID::Restore), &writer)?;
        Ok(())
    }

    fn enter_and_transfer_secure_snapshot_key(&self, config: &ForkHandshakeConfig)
                                              -> Result<(), Error> {
        let mut writer = MessageWriter::new();
        config.encode(&mut writer);
        self.enter(CallID::as_u64(CallID::TransferSecureSnapshotKey), &writer)?;
        Ok(())
    }
}

/// Backend that turns a `LoadConfig` into a running client
pub trait EnclaveLoader: Send + Sync {

    /// Load an enclave without initializing it
    ///
    /// # Inputs
    /// * 'config' is the load configuration; a `fork_config` asks for
    ///   placement at the parent's base address
    /// * 'host' serves the enclave's host calls
    ///
    /// # Returns
    ///
    /// The client, or an error if the enclave could not be loaded

    fn load(&self, config: &LoadConfig, host: Arc<dyn HostExit>)
            -> Result<Arc<dyn EnclaveClient>, Error>;
}

struct Loaded {
    client: Arc<dyn EnclaveClient>,
    config: LoadConfig,
}

/// Loads enclaves and keeps them by name
pub struct EnclaveManager {
    loader:   Box<dyn EnclaveLoader>,
    host:     Arc<dyn HostExit>,
    enclaves: RwLock<HashMap<String, Loaded>>,
}

impl EnclaveManager {

    pub fn new(loader: Box<dyn EnclaveLoader>, host: Arc<dyn HostExit>) -> Self {
        Self{loader: loader, host: host, enclaves: RwLock::new(HashMap::new())}
    }

    /// Load and initialize an enclave
    ///
    /// An enclave already loaded under the same name is destroyed first. It
    /// is not finalized when the new one is a fork child's reload.
    ///
    /// # Inputs
    /// * 'config' is the load configuration
    ///
    /// # Returns
    ///
    /// The client of the initialized enclave, or the load or initialization
    /// error. A failed enclave is not kept.

    pub fn load_enclave(&self, config: LoadConfig) -> Result<Arc<dyn EnclaveClient>, Error> {
        if config.name.is_empty() {
            return Err(Error::InvalidArgument("enclave name is empty".into()));
        }

        if let Some(previous) = self.remove(&config.name)? {
            info!("replacing enclave {}", config.name);
            Self::shut_down(&previous.client, &[], config.fork_config.is_some());
        }

        let client = self.loader.load(&config, self.host.clone())?;
        debug!("enclave {} loaded at {:#x}", config.name, client.base_address());

        /* Registered before initialization so that its host calls can find it */
        let name = config.name.clone();
        self.enclaves.write()
                     .map_err(|_| Error::Internal("enclave table lock".into()))?
                     .insert(name.clone(), Loaded{client: client.clone(), config: config.clone()});

        if let Err(err) = client.enter_and_initialize(&config.enclave_config) {
            warn!("enclave {} failed to initialize: {}", name, err);
            self.remove(&name)?;
            if let Err(release) = client.release() {
                warn!("releasing enclave {} failed: {}", name, release);
            }
            return Err(err);
        }

        Ok(client)
    }

    pub fn get_client(&self, name: &str) -> Option<Arc<dyn EnclaveClient>> {
        let enclaves = self.enclaves.read().ok()?;
        enclaves.get(name).map(|loaded| loaded.client.clone())
    }

    pub fn get_load_config(&self, name: &str) -> Option<LoadConfig> {
        let enclaves = self.enclaves.read().ok()?;
        enclaves.get(name).map(|loaded| loaded.config.clone())
    }

    /// Names of all loaded enclaves
    pub fn names(&self) -> Vec<String> {
        match self.enclaves.read() {
            Ok(enclaves) => enclaves.keys().cloned().collect(),
            Err(_)       => Vec::new(),
        }
    }

    /// Finalize (unless skipped) and release an enclave
    ///
    /// # Inputs
    /// * 'name' is the enclave name
    /// * 'final_input' is passed to the enclave's finalize entry
    /// * 'skip_finalize' releases without entering the enclave
    ///
    /// # Returns
    ///
    /// Ok() when the enclave existed and was released

    pub fn destroy_enclave(&self,
                           name: &str,
                           final_input: &[u8],
                           skip_finalize: bool)
                           -> Result<(), Error> {

        let loaded = self.remove(name)?
                         .ok_or_else(|| Error::InvalidArgument(format!("no enclave named {}", name)))?;
        let finalized = if skip_finalize {
            Ok(())
        } else {
            loaded.client.enter_and_finalize(final_input)
        };

        loaded.client.release()?;
        finalized
    }

    fn remove(&self, name: &str) -> Result<Option<Loaded>, Error> {
        let mut enclaves = self.enclaves.write()
                                        .map_err(|_| Error::Internal("enclave table lock".into()))?;
        Ok(enclaves.remove(name))
    }

    fn shut_down(client: &Arc<dyn EnclaveClient>, final_input: &[u8], skip_finalize: bool) {
        if !skip_finalize {
            if let Err(err) = client.enter_and_finalize(final_input) {
                warn!("finalizing enclave {} failed: {}", client.name(), err);
            }
        }
        if let Err(err) = client.release() {
            warn!("releasing enclave {} failed: {}", client.name(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use edge::Status;

    /* A client that records the selectors it is entered with */
    struct Recorder {
        name:     String,
        calls:    Mutex<Vec<u64>>,
        released: AtomicBool,
        fail_init: bool,
    }

    impl EnclaveClient for Recorder {
        fn name(&self) -> &str { &self.name }
        fn base_address(&self) -> usize { 0x10000 }
        fn enclave_size(&self) -> usize { 0x10000 }
        fn execution_mode(&self) -> ExecutionMode { ExecutionMode::Simulation }
        fn is_execution_active(&self) -> bool { false }
        fn set_process_id(&self) {}

        fn release(&self) -> Result<(), Error> {
            self.released.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn enter(&self, selector: u64, _: &MessageWriter) -> Result<MessageReader, Error> {
            self.calls.lock().unwrap().push(selector);
            if self.fail_init && selector == CallID::as_u64(CallID::Initialize) {
                return Err(Error::FailedPrecondition("refused".into()));
            }
            Ok(MessageReader::empty())
        }
    }

    struct RecorderLoader {
        fail_init: bool,
        loaded:    Mutex<Vec<Arc<Recorder>>>,
    }

    impl EnclaveLoader for RecorderLoader {
        fn load(&self, config: &LoadConfig, _: Arc<dyn HostExit>)
                -> Result<Arc<dyn EnclaveClient>, Error> {
            let client = Arc::new(Recorder{name:      config.name.clone(),
                                           calls:     Mutex::new(Vec::new()),
                                           released:  AtomicBool::new(false),
                                           fail_init: self.fail_init});
            self.loaded.lock().unwrap().push(client.clone());
            Ok(client)
        }
    }

    struct NoHost;

    impl HostExit for NoHost {
        fn exit(&self, _: u64, _: &mut BoundaryParams) -> Status {
            Status::BadCallID
        }
    }

    fn manager(fail_init: bool) -> (EnclaveManager, Arc<RecorderLoader>) {
        let loader = Arc::new(RecorderLoader{fail_init: fail_init, loaded: Mutex::new(Vec::new())});

        struct Shared(Arc<RecorderLoader>);
        impl EnclaveLoader for Shared {
            fn load(&self, config: &LoadConfig, host: Arc<dyn HostExit>)
                    -> Result<Arc<dyn EnclaveClient>, Error> {
                self.0.load(config, host)
            }
        }

        (EnclaveManager::new(Box::new(Shared(loader.clone())), Arc::new(NoHost)), loader)
    }

    #[test]
    fn load_initializes_and_registers() {
        let (manager, loader) = manager(false);
        manager.load_enclave(LoadConfig::new("app", 0x10000)).unwrap();

        assert!(manager.get_client("app").is_some());
        assert_eq!(manager.get_load_config("app").unwrap().enclave_size, 0x10000);
        let loaded = loader.loaded.lock().unwrap();
        assert_eq!(*loaded[0].calls.lock().unwrap(), vec![CallID::as_u64(CallID::Initialize)]);
    }

    #[test]
    fn failed_initialization_is_not_kept() {
        let (manager, loader) = manager(true);
        assert!(manager.load_enclave(LoadConfig::new("app", 0x10000)).is_err());
        assert!(manager.get_client("app").is_none());
        assert!(loader.loaded.lock().unwrap()[0].released.load(Ordering::SeqCst));
    }

    #[test]
    fn reload_replaces_and_finalizes_previous() {
        let (manager, loader) = manager(false);
        manager.load_enclave(LoadConfig::new("app", 0x10000)).unwrap();
        manager.load_enclave(LoadConfig::new("app", 0x10000)).unwrap();

        let loaded = loader.loaded.lock().unwrap();
        assert!(loaded[0].released.load(Ordering::SeqCst));
        assert_eq!(loaded[0].calls.lock().unwrap().last(), Some(&CallID::as_u64(CallID::Finalize)));
        assert!(!loaded[1].released.load(Ordering::SeqCst));
        assert_eq!(manager.names(), vec!["app".to_string()]);
    }

    #[test]
    fn fork_reload_skips_finalize() {
        let (manager, loader) = manager(false);
        manager.load_enclave(LoadConfig::new("app", 0x10000)).unwrap();

        let mut config = LoadConfig::new("app", 0x10000);
        config.fork_config = Some(ForkConfig{base_address: 0x10000, enclave_size: 0x10000});
        manager.load_enclave(config).unwrap();

        let loaded = loader.loaded.lock().unwrap();
        assert!(loaded[0].released.load(Ordering::SeqCst));
        assert_eq!(*loaded[0].calls.lock().unwrap(), vec![CallID::as_u64(CallID::Initialize)]);
    }

    #[test]
    fn destroy_unknown_enclave_fails() {
        let (manager, _) = manager(false);
        assert!(manager.destroy_enclave("missing", &[], false).is_err());
        assert!(manager.load_enclave(LoadConfig::new("", 0x10000)).is_err());
    }
}
