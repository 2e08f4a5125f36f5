//! Simulation backend
//!
//! The trusted side runs in the host process. Its memory image is an
//! anonymous mapping, and entering the enclave is a function call into an
//! `EnclaveEntry` built by a user-supplied factory.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::cell::Cell;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicI32, Ordering};

use edge::ecall::EnclaveEntry;
use edge::message::{MessageReader, MessageWriter};
use edge::ocall::HostExit;
use edge::snapshot::MemoryLayout;
use log::debug;
use nix::unistd::getpid;

use crate::Error;
use crate::enclave::{cross, EnclaveClient, EnclaveLoader, ExecutionMode, LoadConfig};
use crate::memory::EnclaveMemory;

thread_local! {
    /* Base address of the enclave this thread is executing in, 0 if none */
    static ACTIVE_ENCLAVE: Cell<usize> = Cell::new(0);
}

/// What a factory gets to build the trusted side of one enclave
pub struct LoadContext {
    pub name:   String,
    /// Region layout of the mapped image
    pub layout: MemoryLayout,
    /// Host-call gateway for the trusted side
    pub host:   Arc<dyn HostExit>,
}

type EntryFactory = dyn Fn(&LoadContext) -> Result<Arc<dyn EnclaveEntry>, Error> + Send + Sync;

/// Loads simulated enclaves
pub struct SimLoader {
    factory: Box<EntryFactory>,
}

impl SimLoader {
    pub fn new<F>(factory: F) -> Self
        where F: Fn(&LoadContext) -> Result<Arc<dyn EnclaveEntry>, Error> + Send + Sync + 'static {
        Self{factory: Box::new(factory)}
    }
}

impl EnclaveLoader for SimLoader {
    fn load(&self, config: &LoadConfig, host: Arc<dyn HostExit>)
            -> Result<Arc<dyn EnclaveClient>, Error> {

        let (hint, size) = match config.fork_config {
            Some(fork) => (Some(fork.base_address), fork.enclave_size),
            None       => (config.base_address, config.enclave_size),
        };

        let memory = EnclaveMemory::map(hint, size)?;
        let context = LoadContext{name:   config.name.clone(),
                                  layout: memory.layout()?,
                                  host:   host};
        let entry = (self.factory)(&context)?;
        Ok(Arc::new(SimEnclaveClient::new(&config.name, config.mode, memory, entry)))
    }
}

/// Client of a simulated enclave
pub struct SimEnclaveClient {
    name:   String,
    mode:   ExecutionMode,
    base:   usize,
    size:   usize,
    memory: Mutex<Option<EnclaveMemory>>,
    entry:  Arc<dyn EnclaveEntry>,
    /* Process allowed to enter */
    owner:  AtomicI32,
}

impl SimEnclaveClient {

    pub fn new(name: &str,
               mode: ExecutionMode,
               memory: EnclaveMemory,
               entry: Arc<dyn EnclaveEntry>)
               -> Self {
        Self{name:   name.to_string(),
             mode:   mode,
             base:   memory.base(),
             size:   memory.size(),
             memory: Mutex::new(Some(memory)),
             entry:  entry,
             owner:  AtomicI32::new(getpid().as_raw())}
    }

    fn is_released(&self) -> bool {
        match self.memory.lock() {
            Ok(memory) => memory.is_none(),
            Err(_)     => true,
        }
    }
}

impl EnclaveClient for SimEnclaveClient {

    fn name(&self) -> &str {
        &self.name
    }

    fn base_address(&self) -> usize {
        self.base
    }

    fn enclave_size(&self) -> usize {
        self.size
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    fn is_execution_active(&self) -> bool {
        ACTIVE_ENCLAVE.with(|active| active.get() == self.base)
    }

    fn set_process_id(&self) {
        self.owner.store(getpid().as_raw(), Ordering::SeqCst);
    }

    fn release(&self) -> Result<(), Error> {
        let mut memory = self.memory.lock()
                                    .map_err(|_| Error::Internal("enclave memory lock".into()))?;
        if memory.take().is_some() {
            debug!("enclave {} released", self.name);
        }
        Ok(())
    }

    fn enter(&self, selector: u64, input: &MessageWriter) -> Result<MessageReader, Error> {
        if self.is_released() {
            return Err(Error::FailedPrecondition(format!("enclave {} is released", self.name)));
        }
        if self.owner.load(Ordering::SeqCst) != getpid().as_raw() {
            return Err(Error::FailedPrecondition(
                format!("enclave {} entered from a foreign process", self.name)));
        }

        let previous = ACTIVE_ENCLAVE.with(|active| active.replace(self.base));
        let result = cross(&*self.entry, selector, input);
        ACTIVE_ENCLAVE.with(|active| active.set(previous));
        result
    }
}
