//! Trusted signal handling
//!
//! Handlers are registered per bridge signal number. Registration also asks
//! the host to relay the signal; the relay either enters the enclave with
//! `DeliverSignal` or, in simulation mode while the interrupted thread is
//! inside the enclave, calls `direct_signal_entry`.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use edge::bridge::signal::{BridgeSigSet, BridgeSignalHandler, EnclaveSignal};
use lazy_static::lazy_static;
use log::{debug, warn};

use crate::Error;
use crate::ocall::{errno, HostCalls};

/// Trusted handler for one signal
pub type SignalHandler = Arc<dyn Fn(&EnclaveSignal) -> Result<(), Error> + Send + Sync>;

/// Result of delivering a blocked signal
pub const SIGNAL_BLOCKED: i32 = -1;
/// Result of a delivered signal whose handler failed or is missing
pub const SIGNAL_FAILED:  i32 = 1;

lazy_static! {
    /* Bridge signal number to the manager serving direct calls */
    static ref DIRECT: RwLock<HashMap<i32, Weak<SignalManager>>> = RwLock::new(HashMap::new());
}

/// Signal handlers and mask of one enclave
pub struct SignalManager {
    handlers: RwLock<HashMap<i32, SignalHandler>>,
    blocked:  Mutex<BridgeSigSet>,
}

impl SignalManager {

    pub fn new() -> Self {
        Self{handlers: RwLock::new(HashMap::new()),
             blocked:  Mutex::new(BridgeSigSet::empty())}
    }

    /// Install a handler and ask the host to relay the signal
    ///
    /// # Inputs
    /// * 'host' is used for the registration call
    /// * 'enclave_name' names this enclave to the host
    /// * 'signum' is a bridge signal number
    /// * 'handler' runs on delivery
    /// * 'mask' lists bridge signals blocked on the host while it runs
    /// * 'flags' are bridge `SA_*` flags
    ///
    /// # Returns
    ///
    /// Ok() once the host relays the signal. Err(Error::InvalidArgument)
    /// for a number outside the bridge range, or the host's POSIX error.
    /// A handler the host refused is not kept.

    pub fn register(self: &Arc<Self>,
                    host: &HostCalls,
                    enclave_name: &str,
                    signum: i32,
                    handler: SignalHandler,
                    mask: BridgeSigSet,
                    flags: i32)
                    -> Result<(), Error> {

        /* Validates the number */
        BridgeSigSet::empty().add(signum)?;

        let previous = self.handlers
                           .write()
                           .map_err(|_| Error::Internal("signal handler lock".into()))?
                           .insert(signum, handler);

        let descriptor = BridgeSignalHandler{sigaction: direct_signal_entry as usize as u64,
                                             mask:      mask,
                                             flags:     flags};
        if host.register_signal_handler(signum, &descriptor, enclave_name) != 0 {
            let err = Error::posix(errno(), "register signal handler");
            warn!("host refused signal {}: {}", signum, err);
            if let Ok(mut handlers) = self.handlers.write() {
                match previous {
                    Some(previous) => handlers.insert(signum, previous),
                    None           => handlers.remove(&signum),
                };
            }
            return Err(err);
        }

        DIRECT.write()
              .map_err(|_| Error::Internal("direct signal lock".into()))?
              .insert(signum, Arc::downgrade(self));
        debug!("signal {} handled in enclave {}", signum, enclave_name);
        Ok(())
    }

    pub fn block(&self, signum: i32) -> Result<(), Error> {
        self.blocked.lock()
                    .map_err(|_| Error::Internal("signal mask lock".into()))?
                    .add(signum)
    }

    pub fn unblock(&self, signum: i32) -> Result<(), Error> {
        self.blocked.lock()
                    .map_err(|_| Error::Internal("signal mask lock".into()))?
                    .remove(signum)
    }

    pub fn is_blocked(&self, signum: i32) -> bool {
        match self.blocked.try_lock() {
            Ok(mask) => mask.contains(signum),
            Err(_)   => false,
        }
    }

    /// Run the handler of a signal
    ///
    /// # Returns
    ///
    /// 0 when the handler ran, SIGNAL_BLOCKED if the signal is blocked and
    /// SIGNAL_FAILED if the handler failed or there is none

    pub fn deliver(&self, signal: &EnclaveSignal) -> i32 {
        if self.is_blocked(signal.signum) {
            return SIGNAL_BLOCKED;
        }

        /* Do not hold the lock while the handler runs */
        let handler = match self.handlers.try_read() {
            Ok(handlers) => handlers.get(&signal.signum).cloned(),
            Err(_)       => None,
        };
        let handler = match handler {
            Some(handler) => handler,
            None => {
                warn!("no handler for signal {}", signal.signum);
                return SIGNAL_FAILED;
            },
        };

        return match handler(signal) {
            Ok(())   => 0,
            Err(err) => {
                warn!("handler of signal {} failed: {}", signal.signum, err);
                SIGNAL_FAILED
            },
        };
    }
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Direct entry for signals relayed in simulation mode
///
/// Arguments are the bridge signal number and bridge signal code; the
/// result is that of `SignalManager::deliver`.

pub extern "C" fn direct_signal_entry(signum: i32, code: i32) -> i32 {
    let manager = match DIRECT.try_read() {
        Ok(direct) => direct.get(&signum).and_then(|m| m.upgrade()),
        Err(_)     => None,
    };

    return match manager {
        Some(manager) => manager.deliver(&EnclaveSignal{signum: signum, code: code, gregs: Vec::new()}),
        None          => SIGNAL_FAILED,
    };
}
