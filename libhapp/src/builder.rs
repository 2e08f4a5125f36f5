//! A builder pattern API for setting up the host runtime
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::sync::Arc;

use edge::ocall::{CallID, HostExit};
use log::debug;

use crate::Error;
use crate::enclave::{EnclaveClient, EnclaveLoader, EnclaveManager, LoadConfig};
use crate::fork::{fork, fork_listener, ForkError};
use crate::internal::dispatcher::Dispatcher;
use crate::ocall::{default_handlers, Listener};
use crate::signal::register_signal_listener;

/// Host runtime builder
pub struct Builder {
    /// Backend producing enclave clients
    loader:    Option<Box<dyn EnclaveLoader>>,
    /// Extra host-call listeners, by selector
    listeners: Vec<(u64, Box<dyn Listener>)>,
}

/// Builder output
pub struct Host {
    /// Gateway serving host calls of every loaded enclave
    pub dispatcher: Arc<Dispatcher>,
    /// Loaded enclaves
    pub manager:    Arc<EnclaveManager>,
}

impl Builder {

    /// Create a new host runtime builder

    pub fn new() -> Self {
        Self { loader:    None,
               listeners: Vec::new() }
    }

    /// Set the enclave backend
    ///
    /// # Input
    /// * 'loader' produces the clients of loaded enclaves

    pub fn set_loader<L: EnclaveLoader + 'static>(&mut self, loader: L) {
        self.loader = Some(Box::new(loader));
    }

    /// Add a host-call listener
    ///
    /// Built-in listeners for the same selector are replaced.
    ///
    /// # Input
    /// * 'selector' is a named host-call selector
    /// * 'listener' serves the calls
    ///
    /// # Return
    ///
    /// Ok() in case of success, Err(Error::InvalidArgument) for a selector
    /// in the system call space

    pub fn add_listener(&mut self,
                        selector: u64,
                        listener: Box<dyn Listener>)
                        -> Result<(), Error> {

        if selector >= edge::ocall::SYSCALL_BASE {
            return Err(Error::InvalidArgument(
                format!("selector {:#x} is reserved for system calls", selector)));
        }

        self.listeners.push((selector, listener));
        Ok(())
    }

    /// Build the runtime
    ///
    /// # Return
    ///
    /// Ok(Host) with every built-in handler registered, or
    /// Err(Error::FailedPrecondition) if no loader was set

    pub fn build(self) -> Result<Host, Error> {
        let loader = self.loader
                         .ok_or_else(|| Error::FailedPrecondition("no enclave loader".into()))?;

        let dispatcher = Arc::new(Dispatcher::new());
        let host: Arc<dyn HostExit> = dispatcher.clone();
        let manager = Arc::new(EnclaveManager::new(loader, host));

        for (id, listener) in default_handlers() {
            dispatcher.register(CallID::as_u64(id), listener)?;
        }
        dispatcher.register(CallID::as_u64(CallID::Fork),
                            fork_listener(Arc::downgrade(&manager)))?;
        dispatcher.register(CallID::as_u64(CallID::RegisterSignalHandler),
                            register_signal_listener(Arc::downgrade(&manager)))?;

        for (selector, listener) in self.listeners {
            dispatcher.register(selector, listener)?;
        }

        debug!("host runtime ready");
        Ok(Host{dispatcher: dispatcher, manager: manager})
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {

    pub fn load_enclave(&self, config: LoadConfig) -> Result<Arc<dyn EnclaveClient>, Error> {
        self.manager.load_enclave(config)
    }

    pub fn get_client(&self, name: &str) -> Option<Arc<dyn EnclaveClient>> {
        self.manager.get_client(name)
    }

    pub fn destroy_enclave(&self, name: &str, final_input: &[u8]) -> Result<(), Error> {
        self.manager.destroy_enclave(name, final_input, false)
    }

    /// Fork the process, see `fork::fork`
    pub fn fork(&self, name: &str, restore_snapshot: bool) -> Result<i32, ForkError> {
        fork(&self.manager, name, restore_snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use edge::Status;
    use edge::alloc::BoundaryParams;
    use edge::message::{MessageReader, MessageWriter};

    use crate::sim::SimLoader;

    #[test]
    fn build_requires_a_loader() {
        assert!(Builder::new().build().is_err());
    }

    #[test]
    fn system_call_selectors_cannot_be_listened() {
        let mut builder = Builder::new();
        let listener = |_: &mut MessageReader, _: &mut MessageWriter| -> Result<(), Error> { Ok(()) };
        assert!(builder.add_listener(edge::ocall::SYSCALL_BASE, Box::new(listener)).is_err());
    }

    #[test]
    fn built_host_serves_builtin_and_user_calls() {
        let mut builder = Builder::new();
        builder.set_loader(SimLoader::new(|_| Err(Error::Internal("unused".into()))));
        builder.add_listener(edge::ocall::OCALL_USER_BASE, Box::new(
            |_: &mut MessageReader, output: &mut MessageWriter| -> Result<(), Error> {
                output.push(7u32);
                Ok(())
            })).unwrap();
        let host = builder.build().unwrap();

        let mut params = BoundaryParams::from_writer(&MessageWriter::new()).unwrap();
        assert_eq!(host.dispatcher.exit(edge::ocall::OCALL_USER_BASE, &mut params), Status::Success);
        assert_eq!(params.take_output().unwrap().next::<u32>().unwrap(), 7);

        let mut input = MessageWriter::new();
        input.push_str("missing");
        input.push(false);
        let mut params = BoundaryParams::from_writer(&input).unwrap();
        assert_eq!(host.dispatcher.exit(CallID::as_u64(CallID::Fork), &mut params), Status::Success);
        let mut output = params.take_output().unwrap();
        assert_eq!(output.next::<i32>().unwrap(), -1);
        assert_eq!(output.next::<i32>().unwrap(),
                   edge::bridge::sys::to_bridge_errno(libc::EINVAL));
    }
}
