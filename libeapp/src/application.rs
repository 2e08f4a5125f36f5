//! Trusted application lifecycle
//!
//! `TrustedApplication` owns the lifecycle state and serves the seven entry
//! points. Every entry point checks the expected state under the state lock
//! first. User code never runs with the lock held.
//!
//! ```text
//! Uninitialized -> InternalInitializing -> UserInitializing -> Running
//! Running -> Finalizing -> Finalized
//! ```
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use edge::bridge::signal::{BridgeSigSet, EnclaveSignal};
use edge::config::EnclaveConfig;
use edge::message::MessageReader;
use edge::ocall::HostExit;
use edge::snapshot::{ForkHandshakeConfig, MemoryLayout, RegionKind, SnapshotEntryRef,
                     SnapshotLayout};
use log::{debug, error, info, warn, LevelFilter};
use zeroize::Zeroizing;

use crate::Error;
use crate::crypto::{AesGcmSivCryptor, Cryptor};
use crate::ocall::HostCalls;
use crate::signal::{SignalHandler, SignalManager};
use crate::snapshot::{self, HostSocket};

/// Result of `DeliverSignal` for an undecodable signal or a failed handler
pub const DELIVER_FAILED:    i32 = 1;
/// Result of `DeliverSignal` outside Running and Finalizing
pub const DELIVER_NOT_READY: i32 = 2;

/// Lifecycle state
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum EnclaveState {
    Uninitialized        = 0,
    InternalInitializing = 1,
    UserInitializing     = 2,
    Running              = 3,
    Finalizing           = 4,
    Finalized            = 5,
}

/// User part of an enclave application
pub trait Application: Send + Sync {

    /// Called once while initializing, after the environment is set up
    fn initialize(&self, _ctx: &Context, _config: &EnclaveConfig) -> Result<(), Error> {
        Ok(())
    }

    /// Serve one `Run` call
    ///
    /// # Inputs
    /// * 'ctx' is the enclave context
    /// * 'input' is the host's input, possibly empty
    ///
    /// # Returns
    ///
    /// Output returned to the host

    fn run(&self, ctx: &Context, input: &[u8]) -> Result<Vec<u8>, Error>;

    /// Called once while finalizing
    fn finalize(&self, _ctx: &Context, _input: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

/// What the trusted side knows about its enclave
pub struct Context {
    name:    RwLock<String>,
    host:    HostCalls,
    layout:  MemoryLayout,
    signals: Arc<SignalManager>,
    config:  RwLock<EnclaveConfig>,
}

impl Context {

    /// # Inputs
    /// * 'host' serves host calls of this enclave
    /// * 'layout' is the enclave's memory image
    pub fn new(host: Arc<dyn HostExit>, layout: MemoryLayout) -> Self {
        Self{name:    RwLock::new(String::new()),
             host:    HostCalls::new(host),
             layout:  layout,
             signals: Arc::new(SignalManager::new()),
             config:  RwLock::new(EnclaveConfig::default())}
    }

    /// Name given at initialization
    pub fn name(&self) -> String {
        self.name.read().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn host(&self) -> &HostCalls {
        &self.host
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn signals(&self) -> &Arc<SignalManager> {
        &self.signals
    }

    /// Configuration given at initialization
    pub fn config(&self) -> EnclaveConfig {
        self.config.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Handle a bridge signal inside this enclave
    pub fn register_signal_handler(&self, signum: i32, handler: SignalHandler,
                                   mask: BridgeSigSet, flags: i32) -> Result<(), Error> {
        self.signals.register(&self.host, &self.name(), signum, handler, mask, flags)
    }

    /// Fork the host process, see `HostCalls::fork`
    pub fn fork(&self, restore_snapshot: bool) -> i32 {
        self.host.fork(&self.name(), restore_snapshot)
    }

    fn region_range(&self, kind: RegionKind, offset: usize, len: usize) -> Result<usize, Error> {
        let region = self.layout
                         .region(kind)
                         .ok_or_else(|| Error::InvalidArgument(format!("no {:?} region", kind)))?;
        match offset.checked_add(len) {
            Some(end) if end <= region.size => Ok(region.base + offset),
            _ => Err(Error::InvalidArgument(
                format!("{} bytes at {:#x} exceed the {:?} region", len, offset, kind))),
        }
    }

    /// Copy bytes into a memory region of the enclave image
    pub fn write_region(&self, kind: RegionKind, offset: usize, bytes: &[u8]) -> Result<(), Error> {
        let addr = self.region_range(kind, offset, bytes.len())?;
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
        Ok(())
    }

    /// Copy bytes out of a memory region of the enclave image
    pub fn read_region(&self, kind: RegionKind, offset: usize, len: usize) -> Result<Vec<u8>, Error> {
        let addr = self.region_range(kind, offset, len)?;
        let mut bytes = vec![0u8; len];
        unsafe { core::ptr::copy_nonoverlapping(addr as *const u8, bytes.as_mut_ptr(), len) };
        Ok(bytes)
    }
}

/// Lifecycle state machine around an `Application`
pub struct TrustedApplication {
    state:        Mutex<EnclaveState>,
    context:      Context,
    app:          Box<dyn Application>,
    cryptor:      Box<dyn Cryptor>,
    /* Present from TakeSnapshot or key receipt until Restore or key sending */
    snapshot_key: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl TrustedApplication {

    pub fn new<A: Application + 'static>(app: A, context: Context) -> Self {
        Self::with_cryptor(app, context, AesGcmSivCryptor)
    }

    pub fn with_cryptor<A, C>(app: A, context: Context, cryptor: C) -> Self
        where A: Application + 'static, C: Cryptor + 'static {
        Self{state:        Mutex::new(EnclaveState::Uninitialized),
             context:      context,
             app:          Box::new(app),
             cryptor:      Box::new(cryptor),
             snapshot_key: Mutex::new(None)}
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn state(&self) -> EnclaveState {
        self.lock_state().map(|s| *s).unwrap_or(EnclaveState::Finalized)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, EnclaveState>, Error> {
        self.state.lock().map_err(|_| Error::Internal("enclave state lock".into()))
    }

    fn set_state(&self, state: EnclaveState) -> Result<(), Error> {
        *self.lock_state()? = state;
        Ok(())
    }

    /* Transition from 'from' to 'to', or fail leaving the state as is */
    fn transition(&self, from: EnclaveState, to: EnclaveState) -> Result<(), Error> {
        let mut state = self.lock_state()?;
        if *state != from {
            return Err(Error::FailedPrecondition(
                format!("Enclave not in state {:?}, but {:?}", from, *state)));
        }
        *state = to;
        Ok(())
    }

    fn expect_running(&self) -> Result<(), Error> {
        let state = self.lock_state()?;
        if *state != EnclaveState::Running {
            return Err(Error::FailedPrecondition("Enclave not in state RUNNING".into()));
        }
        Ok(())
    }

    fn expect_fork_enabled(&self) -> Result<(), Error> {
        if !self.context.config().enable_fork {
            return Err(Error::FailedPrecondition("Insecure fork not enabled".into()));
        }
        Ok(())
    }

    fn snapshot_key(&self) -> Result<MutexGuard<'_, Option<Zeroizing<Vec<u8>>>>, Error> {
        self.snapshot_key.lock().map_err(|_| Error::Internal("snapshot key lock".into()))
    }

    /// Initialize entry point
    ///
    /// Installs the environment variables that are not set yet, applies the
    /// log level and working directory, then runs the user initialization.
    /// Any failure returns the enclave to Uninitialized.
    ///
    /// # Inputs
    /// * 'name' is the enclave's name on the host
    /// * 'config' is the enclave configuration

    pub fn initialize(&self, name: &str, config: EnclaveConfig) -> Result<(), Error> {
        self.transition(EnclaveState::Uninitialized, EnclaveState::InternalInitializing)?;

        let result = self.initialize_internal(name, config)
                         .and_then(|_| self.transition(EnclaveState::InternalInitializing,
                                                       EnclaveState::UserInitializing))
                         .and_then(|_| self.app.initialize(&self.context, &self.context.config()))
                         .and_then(|_| self.transition(EnclaveState::UserInitializing,
                                                       EnclaveState::Running));
        if let Err(err) = result {
            warn!("initialization of enclave {} failed: {}", name, err);
            self.set_state(EnclaveState::Uninitialized)?;
            return Err(err);
        }

        info!("enclave {} running", name);
        Ok(())
    }

    fn initialize_internal(&self, name: &str, config: EnclaveConfig) -> Result<(), Error> {
        for variable in &config.environment_variables {
            let (key, value) = match (&variable.name, &variable.value) {
                (Some(key), Some(value)) => (key, value),
                _ => return Err(Error::InvalidArgument(
                    "environment variable without name or value".into())),
            };
            if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
                return Err(Error::InvalidArgument(format!("environment variable {:?}", key)));
            }
            if std::env::var_os(key).is_none() {
                std::env::set_var(key, value);
            } else {
                debug!("environment variable {} kept", key);
            }
        }

        if let Some(level) = log_level(config.logging.vlog_level) {
            log::set_max_level(level);
        }

        if !config.current_working_directory.is_empty() {
            std::env::set_current_dir(&config.current_working_directory)
                .map_err(|e| Error::posix(e.raw_os_error().unwrap_or(libc::EINVAL),
                                          "set working directory"))?;
        }

        *self.context.name.write().map_err(|_| Error::Internal("name lock".into()))? =
            name.to_string();
        *self.context.config.write().map_err(|_| Error::Internal("config lock".into()))? =
            config;
        Ok(())
    }

    /// Run entry point
    pub fn run(&self, input: &[u8]) -> Result<Vec<u8>, Error> {
        self.expect_running()?;
        self.app.run(&self.context, input)
    }

    /// Finalize entry point; the enclave is Finalized afterwards even if
    /// the user finalization fails
    pub fn finalize(&self, input: &[u8]) -> Result<(), Error> {
        self.transition(EnclaveState::Running, EnclaveState::Finalizing)?;
        let result = self.app.finalize(&self.context, input);
        self.set_state(EnclaveState::Finalized)?;
        if let Err(err) = &result {
            warn!("finalization of enclave {} failed: {}", self.context.name(), err);
        }
        result
    }

    /// DeliverSignal entry point
    ///
    /// # Returns
    ///
    /// 0 on success, DELIVER_FAILED for an undecodable signal or a failed
    /// handler, DELIVER_NOT_READY outside Running and Finalizing, and
    /// `signal::SIGNAL_BLOCKED` for a blocked signal

    pub fn deliver_signal(&self, input: &mut MessageReader) -> i32 {
        let signal = match EnclaveSignal::decode(input) {
            Ok(signal) => signal,
            Err(err)   => {
                warn!("undecodable signal: {}", err);
                return DELIVER_FAILED;
            },
        };

        let state = self.state();
        if state < EnclaveState::Running || state > EnclaveState::Finalizing {
            return DELIVER_NOT_READY;
        }
        self.context.signals.deliver(&signal)
    }

    /// TakeSnapshot entry point
    ///
    /// Seals the memory image under a fresh key kept for the key transfer.

    pub fn take_snapshot(&self) -> Result<SnapshotLayout, Error> {
        self.expect_fork_enabled()?;
        self.expect_running()?;

        let key = snapshot::generate_key();
        let layout = unsafe { snapshot::take_snapshot(&self.context.layout, &*self.cryptor, &key)? };
        *self.snapshot_key()? = Some(key);
        Ok(layout)
    }

    /// Restore entry point
    pub fn restore(&self, entries: &[SnapshotEntryRef]) -> Result<(), Error> {
        self.restore_with(|| Ok(entries.to_vec()))
    }

    /// Restore from entries produced by `parse`
    ///
    /// Once the preconditions hold, any failure, including one of `parse`,
    /// leaves the enclave Finalized. The snapshot key is used once.

    pub fn restore_with<'a, F>(&self, parse: F) -> Result<(), Error>
        where F: FnOnce() -> Result<Vec<SnapshotEntryRef<'a>>, Error> {

        self.expect_fork_enabled()?;
        self.expect_running()?;

        let result = parse().and_then(|entries| {
            let key = self.snapshot_key()?
                          .take()
                          .ok_or_else(|| Error::FailedPrecondition("no snapshot key".into()))?;
            unsafe { snapshot::restore(&self.context.layout, &*self.cryptor, &key, &entries) }
        });

        if let Err(err) = &result {
            error!("restore of enclave {} failed: {}", self.context.name(), err);
            self.set_state(EnclaveState::Finalized)?;
        }
        result
    }

    /// TransferSecureSnapshotKey entry point
    ///
    /// The parent sends its snapshot key and forgets it, the child keeps
    /// the key it receives.

    pub fn transfer_secure_snapshot_key(&self, handshake: &ForkHandshakeConfig)
                                        -> Result<(), Error> {
        self.expect_running()?;
        let mut channel = HostSocket::new(&self.context.host, handshake.socket);

        if handshake.is_parent {
            let key = self.snapshot_key()?
                          .take()
                          .ok_or_else(|| Error::FailedPrecondition("no snapshot key".into()))?;
            snapshot::send_key(&mut channel, &*self.cryptor, &key)?;
            debug!("snapshot key sent");
        } else {
            let key = snapshot::receive_key(&mut channel, &*self.cryptor)?;
            *self.snapshot_key()? = Some(key);
            debug!("snapshot key received");
        }
        Ok(())
    }
}

fn log_level(vlog_level: i32) -> Option<LevelFilter> {
    return match vlog_level {
        i32::MIN ..= -1 => None,
        0 => Some(LevelFilter::Error),
        1 => Some(LevelFilter::Warn),
        2 => Some(LevelFilter::Info),
        3 => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    };
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use edge::Status;
    use edge::alloc::BoundaryParams;
    use edge::config::EnvironmentVariable;
    use edge::message::MessageWriter;

    pub(crate) const PAGE: usize = 4096;

    /* Page-aligned image standing in for enclave memory */
    pub(crate) struct Image {
        ptr:    *mut u8,
        layout: std::alloc::Layout,
    }

    impl Image {
        pub(crate) fn new(pages: usize) -> Self {
            let layout = std::alloc::Layout::from_size_align(pages * PAGE, PAGE).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self{ptr: ptr, layout: layout}
        }

        pub(crate) fn memory(&self) -> MemoryLayout {
            MemoryLayout::partition(self.ptr as usize, self.layout.size(), PAGE).unwrap()
        }

        pub(crate) fn bytes(&mut self) -> &mut [u8] {
            unsafe { core::slice::from_raw_parts_mut(self.ptr, self.layout.size()) }
        }
    }

    impl Drop for Image {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        }
    }

    /* Fails every host call */
    pub(crate) struct NoHost;

    impl HostExit for NoHost {
        fn exit(&self, selector: u64, params: &mut BoundaryParams) -> Status {
            let mut output = MessageWriter::new();
            Error::BadSelector(selector).encode(&mut output);
            params.set_output(&output).unwrap();
            Status::BadCallID
        }
    }

    /* Echoes its input, fails initialization on request */
    #[derive(Default)]
    pub(crate) struct Echo {
        pub(crate) fail_init: AtomicBool,
        pub(crate) finalized: Arc<AtomicBool>,
    }

    impl Application for Echo {
        fn initialize(&self, _ctx: &Context, _config: &EnclaveConfig) -> Result<(), Error> {
            if self.fail_init.load(Ordering::SeqCst) {
                return Err(Error::Internal("refused".into()));
            }
            Ok(())
        }

        fn run(&self, _ctx: &Context, input: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(input.to_vec())
        }

        fn finalize(&self, _ctx: &Context, _input: &[u8]) -> Result<(), Error> {
            self.finalized.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn trusted(image: &Image, app: Echo) -> TrustedApplication {
        TrustedApplication::new(app, Context::new(Arc::new(NoHost), image.memory()))
    }

    fn fork_config() -> EnclaveConfig {
        let mut config = EnclaveConfig::default();
        config.enable_fork = true;
        config
    }

    #[test]
    fn run_requires_initialization() {
        let image = Image::new(8);
        let app = trusted(&image, Echo::default());
        assert!(matches!(app.run(b"x"), Err(Error::FailedPrecondition(_))));
        assert_eq!(app.state(), EnclaveState::Uninitialized);

        app.initialize("echo", EnclaveConfig::default()).unwrap();
        assert_eq!(app.run(b"x").unwrap(), b"x");
        assert_eq!(app.context().name(), "echo");
    }

    #[test]
    fn second_initialization_fails() {
        let image = Image::new(8);
        let app = trusted(&image, Echo::default());
        app.initialize("echo", EnclaveConfig::default()).unwrap();
        assert!(matches!(app.initialize("echo", EnclaveConfig::default()),
                         Err(Error::FailedPrecondition(_))));
        assert_eq!(app.state(), EnclaveState::Running);
    }

    #[test]
    fn failed_initialization_can_be_retried() {
        let image = Image::new(8);
        let echo = Echo::default();
        echo.fail_init.store(true, Ordering::SeqCst);
        let app = trusted(&image, echo);
        assert!(app.initialize("echo", EnclaveConfig::default()).is_err());
        assert_eq!(app.state(), EnclaveState::Uninitialized);
    }

    #[test]
    fn finalize_runs_once() {
        let image = Image::new(8);
        let echo = Echo::default();
        let finalized = echo.finalized.clone();
        let app = trusted(&image, echo);
        app.initialize("echo", EnclaveConfig::default()).unwrap();
        app.finalize(b"").unwrap();
        assert!(finalized.load(Ordering::SeqCst));
        assert_eq!(app.state(), EnclaveState::Finalized);
        assert!(matches!(app.finalize(b""), Err(Error::FailedPrecondition(_))));
        assert!(app.run(b"x").is_err());
    }

    #[test]
    fn environment_is_set_without_overwriting() {
        std::env::set_var("EAPP_TEST_KEPT", "host");
        let mut config = EnclaveConfig::default();
        config.environment_variables = vec![EnvironmentVariable::new("EAPP_TEST_KEPT", "enclave"),
                                            EnvironmentVariable::new("EAPP_TEST_NEW", "enclave")];
        let image = Image::new(8);
        let app = trusted(&image, Echo::default());
        app.initialize("env", config).unwrap();
        assert_eq!(std::env::var("EAPP_TEST_KEPT").unwrap(), "host");
        assert_eq!(std::env::var("EAPP_TEST_NEW").unwrap(), "enclave");
    }

    #[test]
    fn incomplete_environment_variable_is_rejected() {
        let mut config = EnclaveConfig::default();
        config.environment_variables = vec![EnvironmentVariable{name:  Some("EAPP_TEST_HALF".into()),
                                                                value: None}];
        let image = Image::new(8);
        let app = trusted(&image, Echo::default());
        assert!(matches!(app.initialize("env", config), Err(Error::InvalidArgument(_))));
        assert_eq!(app.state(), EnclaveState::Uninitialized);
    }

    #[test]
    fn snapshot_requires_enabled_fork() {
        let image = Image::new(8);
        let app = trusted(&image, Echo::default());
        app.initialize("nofork", EnclaveConfig::default()).unwrap();
        match app.take_snapshot() {
            Err(Error::FailedPrecondition(msg)) => assert_eq!(msg, "Insecure fork not enabled"),
            other => panic!("unexpected {:?}", other.map(|s| s.entries.len())),
        }
        assert!(app.restore(&[]).is_err());
        assert_eq!(app.state(), EnclaveState::Running);
    }

    #[test]
    fn restore_round_trip_and_single_use_key() {
        let image = Image::new(8);
        let app = trusted(&image, Echo::default());
        app.initialize("fork", fork_config()).unwrap();
        app.context().write_region(RegionKind::Heap, 16, b"state").unwrap();

        let snapshot = app.take_snapshot().unwrap();
        app.context().write_region(RegionKind::Heap, 16, b"xxxxx").unwrap();

        let mut writer = MessageWriter::new();
        snapshot.lend(&mut writer);
        let mut reader = MessageReader::from(writer);
        let entries = unsafe { edge::snapshot::borrow_entries(&mut reader).unwrap() };
        app.restore(&entries).unwrap();
        assert_eq!(app.context().read_region(RegionKind::Heap, 16, 5).unwrap(), b"state");
        assert_eq!(app.state(), EnclaveState::Running);

        /* The key is gone */
        assert!(app.restore(&entries).is_err());
        assert_eq!(app.state(), EnclaveState::Finalized);
    }

    #[test]
    fn failed_restore_finalizes() {
        let image = Image::new(8);
        let app = trusted(&image, Echo::default());
        app.initialize("fork", fork_config()).unwrap();
        let _snapshot = app.take_snapshot().unwrap();
        assert!(app.restore_with(|| Err(Error::Malformed("bad".into()))).is_err());
        assert_eq!(app.state(), EnclaveState::Finalized);
        assert!(app.run(b"x").is_err());
    }

    #[test]
    fn signals_need_a_running_enclave() {
        let image = Image::new(8);
        let app = trusted(&image, Echo::default());
        let signal = EnclaveSignal{signum: 10, code: 0, gregs: Vec::new()};
        let mut writer = MessageWriter::new();
        signal.encode(&mut writer);
        assert_eq!(app.deliver_signal(&mut MessageReader::from(writer.clone())), DELIVER_NOT_READY);

        app.initialize("signals", EnclaveConfig::default()).unwrap();
        /* No handler registered */
        assert_eq!(app.deliver_signal(&mut MessageReader::from(writer)), crate::signal::SIGNAL_FAILED);
        assert_eq!(app.deliver_signal(&mut MessageReader::empty()), DELIVER_FAILED);
    }

    #[test]
    fn region_access_is_bounds_checked() {
        let image = Image::new(8);
        let app = trusted(&image, Echo::default());
        let heap = app.context().layout().region(RegionKind::Heap).unwrap().size;
        assert!(app.context().write_region(RegionKind::Heap, heap - 1, b"ab").is_err());
        assert!(app.context().read_region(RegionKind::Stack, usize::MAX, 1).is_err());
    }
}
