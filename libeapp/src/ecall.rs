//! Entry-point server: the trusted side of every boundary crossing
//!
//! `Server` implements `EnclaveEntry`. It takes and frees the input
//! buffer, dispatches on the selector, and always allocates the output
//! buffer for the reply. An error is encoded into the output next to its
//! status. A panic never crosses the boundary: it aborts the enclave.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use edge::alloc::BoundaryParams;
use edge::config::EnclaveConfig;
use edge::ecall::{EnclaveEntry, ECALL_USER_BASE};
use edge::message::{MessageReader, MessageWriter};
use edge::ocall::HostExit;
use edge::snapshot::{borrow_entries, ForkHandshakeConfig, MemoryLayout};
use log::{debug, warn};

pub use edge::ecall::CallID;

use crate::{enclave_abort, Error, Status};
use crate::application::{Application, Context, TrustedApplication};

/// A listener for receiving user-defined entry calls
pub trait Listener: Send + Sync {

    /// Callback for handling user-defined entry calls
    ///
    /// # Input
    /// * 'ctx' is the enclave context
    /// * 'input' holds the call arguments
    /// * 'output' collects the reply
    ///
    /// # Return
    ///
    /// Call status returned to the host

    fn on_ecall(&self, ctx: &Context, input: &mut MessageReader, output: &mut MessageWriter)
                -> Status;
}

impl<F> Listener for F
    where F: Fn(&Context, &mut MessageReader, &mut MessageWriter) -> Result<(), Error> + Send + Sync
{
    fn on_ecall(&self, ctx: &Context, input: &mut MessageReader, output: &mut MessageWriter)
                -> Status {
        match self(ctx, input, output) {
            Ok(())   => Status::Success,
            Err(err) => {
                *output = MessageWriter::new();
                err.encode(output);
                err.status()
            },
        }
    }
}

/// Entry-point server of one enclave
pub struct Server {
    app:       Arc<TrustedApplication>,
    listeners: HashMap<u64, Box<dyn Listener>>,
}

impl Server {

    pub fn new(app: Arc<TrustedApplication>) -> Self {
        Self{app: app, listeners: HashMap::new()}
    }

    /// Server for `app` in an enclave with the given host and memory
    pub fn with_application<A: Application + 'static>(app: A,
                                                      host: Arc<dyn HostExit>,
                                                      layout: MemoryLayout) -> Self {
        Self::new(Arc::new(TrustedApplication::new(app, Context::new(host, layout))))
    }

    pub fn application(&self) -> &Arc<TrustedApplication> {
        &self.app
    }

    /// Add a listener for a user-defined entry call
    ///
    /// # Input
    /// * 'selector' is at least `ECALL_USER_BASE`
    /// * 'listener' serves the calls
    ///
    /// # Return
    ///
    /// Ok() or Err(Error::InvalidArgument) for a reserved selector

    pub fn add_listener(&mut self, selector: u64, listener: Box<dyn Listener>)
                        -> Result<(), Error> {
        if selector < ECALL_USER_BASE {
            return Err(Error::InvalidArgument(
                format!("selector {:#x} is reserved for lifecycle calls", selector)));
        }
        if self.listeners.insert(selector, listener).is_some() {
            warn!("listener for entry call {:#x} replaced", selector);
        }
        Ok(())
    }

    fn dispatch(&self, selector: u64, input: &mut MessageReader, output: &mut MessageWriter)
                -> Result<Status, Error> {

        let id = match CallID::from_u64(selector) {
            Some(id) => id,
            None => {
                let listener = self.listeners
                                   .get(&selector)
                                   .ok_or(Error::BadSelector(selector))?;
                return Ok(listener.on_ecall(self.app.context(), input, output));
            },
        };

        debug!("entry call {:?}", id);
        match id {
            CallID::Initialize => {
                let name = input.next_string()?;
                let config = EnclaveConfig::decode(input)?;
                self.app.initialize(&name, config)?;
            },
            CallID::Run => {
                let data = next_payload(input)?;
                let result = self.app.run(&data)?;
                if !result.is_empty() {
                    output.push_bytes(&result);
                }
            },
            CallID::Finalize => {
                let data = next_payload(input)?;
                self.app.finalize(&data)?;
            },
            CallID::DeliverSignal => {
                output.push(self.app.deliver_signal(input));
            },
            CallID::TakeSnapshot => {
                self.app.take_snapshot()?.into_message(output);
            },
            CallID::Restore => {
                /* The host keeps the lent layout alive for the whole call */
                self.app.restore_with(|| unsafe { borrow_entries(input) })?;
            },
            CallID::TransferSecureSnapshotKey => {
                let handshake = ForkHandshakeConfig::decode(input)
                    .map_err(|e| Error::InvalidArgument(format!("fork handshake: {}", e)))?;
                self.app.transfer_secure_snapshot_key(&handshake)?;
            },
        }
        Ok(Status::Success)
    }

    fn serve(&self, selector: u64, params: &mut BoundaryParams) -> Status {
        let mut output = MessageWriter::new();
        let status = match params.take_input()
                                 .and_then(|mut input| self.dispatch(selector, &mut input, &mut output)) {
            Ok(status) => status,
            Err(err)   => {
                debug!("entry call {:#x} failed: {}", selector, err);
                output = MessageWriter::new();
                err.encode(&mut output);
                err.status()
            },
        };

        if let Err(err) = params.set_output(&output) {
            enclave_abort(&format!("cannot allocate the reply: {}", err));
        }
        status
    }
}

fn next_payload(input: &mut MessageReader) -> Result<Vec<u8>, Error> {
    if input.has_next() {
        return input.next_bytes();
    }
    Ok(Vec::new())
}

impl EnclaveEntry for Server {
    fn enter(&self, selector: u64, params: &mut BoundaryParams) -> Status {
        return match catch_unwind(AssertUnwindSafe(|| self.serve(selector, params))) {
            Ok(status) => status,
            Err(_)     => enclave_abort(&format!("panic in entry call {:#x}", selector)),
        };
    }
}
