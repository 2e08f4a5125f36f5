//! Host-call dispatcher
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use edge::alloc::BoundaryParams;
use edge::message::{MessageReader, MessageWriter};
use edge::ocall::{HostExit, Selector, SYSCALL_BASE};
use log::{error, warn};

use crate::{Error, Status};
use crate::ocall::Listener;
use crate::syscall;

/// Routes host calls from the enclave to their listeners
pub struct Dispatcher {
    /// A table mapping selectors to Listeners
    table: RwLock<HashMap<u64, Arc<dyn Listener>>>,
}

impl Dispatcher {

    pub(crate) fn new() -> Self {
        Self{table: RwLock::new(HashMap::new())}
    }

    /// Register a listener, replacing any earlier one for the selector
    ///
    /// # Inputs
    /// * 'selector' is a named selector below the system call space
    /// * 'listener' serves the calls
    ///
    /// # Returns
    ///
    /// Ok() on success, Err(Error::InvalidArgument) for a selector in the
    /// system call space

    pub fn register(&self, selector: u64, listener: Box<dyn Listener>) -> Result<(), Error> {
        if selector >= SYSCALL_BASE {
            return Err(Error::InvalidArgument(
                format!("selector {:#x} is reserved for system calls", selector)));
        }

        let mut table = self.table.write()
                                  .map_err(|_| Error::Internal("dispatch table lock".into()))?;
        if table.insert(selector, Arc::from(listener)).is_some() {
            warn!("listener for selector {:#x} replaced", selector);
        }
        Ok(())
    }

    /// Serve one host call
    ///
    /// The input buffer is taken (and freed) before the handler runs. The
    /// output buffer is allocated only for a non-empty result.

    pub fn dispatch(&self, selector: u64, params: &mut BoundaryParams) -> Status {
        params.output = None;
        let mut input = match params.take_input() {
            Ok(input) => input,
            Err(err)  => {
                warn!("undecodable arguments for selector {:#x}: {}", selector, err);
                return Self::fail(params, err);
            },
        };

        let mut output = MessageWriter::new();
        let status = match Selector::from_u64(selector) {
            Selector::Syscall(sysno) => {
                let generic = |input: &mut MessageReader, output: &mut MessageWriter| {
                    syscall::on_syscall(sysno, input, output)
                };
                generic.on_ocall(&mut input, &mut output)
            },
            Selector::Handler(id) => {
                /* Not locked while the listener runs: fork re-enters the enclave */
                let listener = match self.table.read() {
                    Ok(table) => table.get(&id).cloned(),
                    Err(_)    => return Self::fail(params,
                                                   Error::Internal("dispatch table lock".into())),
                };
                match listener {
                    Some(listener) => listener.on_ocall(&mut input, &mut output),
                    None => {
                        warn!("no listener for selector {:#x}", id);
                        return Status::BadCallID;
                    },
                }
            },
        };

        if let Err(err) = params.set_output(&output) {
            error!("cannot allocate result for selector {:#x}: {}", selector, err);
            return err.status();
        }

        status
    }

    fn fail(params: &mut BoundaryParams, err: Error) -> Status {
        let mut output = MessageWriter::new();
        err.encode(&mut output);
        /* Best effort: the status alone still reports the failure */
        let _ = params.set_output(&output);
        err.status()
    }
}

impl HostExit for Dispatcher {
    fn exit(&self, selector: u64, params: &mut BoundaryParams) -> Status {
        self.dispatch(selector, params)
    }
}
