//! Signal relay from the host into enclaves
//!
//! The enclave registers a handler for a bridge signal number through a
//! host call. The relay records which enclave owns the host signal and
//! installs a host handler. In hardware mode the handler always enters the
//! enclave; in simulation mode it calls the trusted handler directly when
//! the interrupted thread is already executing inside that enclave.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, RwLock, Weak};

use edge::bridge::signal::{from_bridge_signal, from_bridge_signal_flags, to_bridge_signal,
                           to_bridge_signal_code, BridgeSignalHandler, EnclaveSignal};
use edge::message::{MessageReader, MessageWriter};
use lazy_static::lazy_static;
use libc::{c_int, siginfo_t};
use log::{debug, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::Error;
use crate::enclave::{EnclaveClient, EnclaveManager, ExecutionMode};
use crate::ocall::{reply_error, Listener};

/// Trusted handler entered directly in simulation mode:
/// (bridge signal number, bridge signal code) -> result
pub type DirectHandler = extern "C" fn(i32, i32) -> i32;

#[derive(Clone)]
struct Registration {
    client: Arc<dyn EnclaveClient>,
    /* DirectHandler address, 0 if the enclave gave none */
    direct: u64,
}

lazy_static! {
    /* Host signal number to owning enclave */
    static ref REGISTRY: RwLock<HashMap<c_int, Registration>> = RwLock::new(HashMap::new());
}

/// Enclave that owns a host signal, if any
pub fn registered_client(host_signum: c_int) -> Option<Arc<dyn EnclaveClient>> {
    let registry = REGISTRY.read().ok()?;
    registry.get(&host_signum).map(|reg| reg.client.clone())
}

/// Register an enclave's handler for a signal and install the host handler
///
/// # Inputs
/// * 'bridge_signum' is the bridge signal number
/// * 'handler' is the trusted handler descriptor
/// * 'client' is the owning enclave
///
/// # Returns
///
/// Ok() when installed. A POSIX error with EINVAL when the signal has no
/// host counterpart, or the sigaction error.

pub fn register_signal(bridge_signum: i32,
                       handler: &BridgeSignalHandler,
                       client: Arc<dyn EnclaveClient>)
                       -> Result<(), Error> {

    let host = from_bridge_signal(bridge_signum);
    if host <= 0 {
        return Err(Error::posix(libc::EINVAL, "signal has no host number"));
    }
    let signal = Signal::try_from(host)
                        .map_err(|errno| Error::posix(errno as i32, "signal cannot be handled"))?;

    let mut mask = SigSet::empty();
    for bridge in handler.mask.iter() {
        if let Ok(blocked) = Signal::try_from(from_bridge_signal(bridge)) {
            mask.add(blocked);
        }
    }
    let flags = SaFlags::from_bits_truncate(from_bridge_signal_flags(handler.flags))
              | SaFlags::SA_SIGINFO;
    let entry = match client.execution_mode() {
        ExecutionMode::Hardware   => hardware_handler as extern "C" fn(c_int, *mut siginfo_t, *mut c_void),
        ExecutionMode::Simulation => simulation_handler,
    };

    let action = SigAction::new(SigHandler::SigAction(entry), flags, mask);
    unsafe { sigaction(signal, &action) }
        .map_err(|errno| Error::posix(errno as i32, "sigaction"))?;

    let mut registry = REGISTRY.write()
                               .map_err(|_| Error::Internal("signal registry lock".into()))?;
    let name = client.name().to_string();
    if let Some(previous) = registry.insert(host, Registration{client: client, direct: handler.sigaction}) {
        warn!("signal {} handler of enclave {} overwritten by enclave {}",
              host, previous.client.name(), name);
    }

    debug!("signal {} relayed to the enclave", host);
    Ok(())
}

extern "C" fn hardware_handler(signum: c_int, info: *mut siginfo_t, _context: *mut c_void) {
    relay(signum, info, false);
}

extern "C" fn simulation_handler(signum: c_int, info: *mut siginfo_t, _context: *mut c_void) {
    relay(signum, info, true);
}

fn relay(signum: c_int, info: *mut siginfo_t, allow_direct: bool) {
    /* Never block inside a signal handler */
    let registration = match REGISTRY.try_read() {
        Ok(registry) => registry.get(&signum).cloned(),
        Err(_)       => None,
    };
    let registration = match registration {
        Some(registration) => registration,
        None               => return,
    };

    let code = if info.is_null() { 0 } else { to_bridge_signal_code(unsafe { (*info).si_code }) };
    let signal = EnclaveSignal{signum: to_bridge_signal(signum), code: code, gregs: Vec::new()};

    if allow_direct && registration.direct != 0 && registration.client.is_execution_active() {
        let direct: DirectHandler = unsafe { std::mem::transmute(registration.direct as usize) };
        direct(signal.signum, signal.code);
        return;
    }

    if let Err(err) = deliver(&*registration.client, &signal) {
        warn!("signal {} not handled: {}", signum, err);
    }
}

/// Enter the enclave to run its handler for `signal`
///
/// # Returns
///
/// Ok() when the enclave reports the handler ran, otherwise the entry
/// failure or an error carrying the enclave's result code

pub fn deliver(client: &dyn EnclaveClient, signal: &EnclaveSignal) -> Result<(), Error> {
    return match client.enter_and_handle_signal(signal)? {
        0    => Ok(()),
        code => Err(Error::Internal(
            format!("enclave {} returned {} for signal {}", client.name(), code, signal.signum))),
    };
}

/// Listener for `CallID::RegisterSignalHandler`
///
/// Arguments: bridge signal number, `BridgeSignalHandler`, enclave name.
/// Reply: result (0 or -1) and bridge errno.

pub(crate) fn register_signal_listener(manager: Weak<EnclaveManager>) -> Box<dyn Listener> {
    Box::new(move |input: &mut MessageReader, output: &mut MessageWriter| -> Result<(), Error> {
        let bridge_signum = input.next::<i32>()?;
        let handler = BridgeSignalHandler::decode(input)?;
        let name = input.next_string()?;

        let manager = manager.upgrade()
                             .ok_or_else(|| Error::FailedPrecondition("host runtime is gone".into()))?;
        let client = match manager.get_client(&name) {
            Some(client) => client,
            None => {
                warn!("signal registration from unknown enclave {}", name);
                reply_error(output, -1i32, libc::EINVAL);
                return Ok(());
            },
        };

        match register_signal(bridge_signum, &handler, client) {
            Ok(()) => reply_error(output, 0i32, 0),
            Err(err) => {
                warn!("signal {} registration failed: {}", bridge_signum, err);
                reply_error(output, -1i32, err.errno());
            },
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI32, Ordering};

    use edge::bridge::signal::{BridgeSigSet, BRIDGE_SIGKILL, BRIDGE_SIGUSR1, BRIDGE_SIGUSR2};
    use edge::ecall::CallID;
    use nix::sys::signal::raise;

    struct Catcher {
        mode:   ExecutionMode,
        active: bool,
        seen:   Mutex<Vec<EnclaveSignal>>,
        /* DeliverSignal result */
        result: i32,
    }

    impl Catcher {
        fn new(mode: ExecutionMode, active: bool) -> Self {
            Self{mode: mode, active: active, seen: Mutex::new(Vec::new()), result: 0}
        }
    }

    impl EnclaveClient for Catcher {
        fn name(&self) -> &str { "catcher" }
        fn base_address(&self) -> usize { 0 }
        fn enclave_size(&self) -> usize { 0 }
        fn execution_mode(&self) -> ExecutionMode { self.mode }
        fn is_execution_active(&self) -> bool { self.active }
        fn set_process_id(&self) {}
        fn release(&self) -> Result<(), Error> { Ok(()) }

        fn enter(&self, selector: u64, input: &MessageWriter) -> Result<MessageReader, Error> {
            assert_eq!(selector, CallID::as_u64(CallID::DeliverSignal));
            let mut reader = MessageReader::deserialize(&input.to_bytes())?;
            self.seen.lock().unwrap().push(EnclaveSignal::decode(&mut reader)?);
            let mut output = MessageWriter::new();
            output.push(self.result);
            Ok(MessageReader::from(output))
        }
    }

    static DIRECT_SEEN: AtomicI32 = AtomicI32::new(0);

    extern "C" fn direct(signum: i32, _code: i32) -> i32 {
        DIRECT_SEEN.store(signum, Ordering::SeqCst);
        0
    }

    #[test]
    fn signal_crosses_into_inactive_enclave() {
        let client = Arc::new(Catcher::new(ExecutionMode::Simulation, false));
        let handler = BridgeSignalHandler{sigaction: direct as usize as u64,
                                          mask:      BridgeSigSet::empty(),
                                          flags:     0};
        register_signal(BRIDGE_SIGUSR1, &handler, client.clone()).unwrap();
        assert!(registered_client(libc::SIGUSR1).is_some());

        raise(Signal::SIGUSR1).unwrap();
        let seen = client.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].signum, BRIDGE_SIGUSR1);
    }

    #[test]
    fn active_simulated_enclave_is_called_directly() {
        let client = Arc::new(Catcher::new(ExecutionMode::Simulation, true));
        let handler = BridgeSignalHandler{sigaction: direct as usize as u64,
                                          mask:      BridgeSigSet::empty(),
                                          flags:     0};
        register_signal(BRIDGE_SIGUSR2, &handler, client.clone()).unwrap();

        raise(Signal::SIGUSR2).unwrap();
        assert_eq!(DIRECT_SEEN.load(Ordering::SeqCst), BRIDGE_SIGUSR2);
        assert!(client.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_and_unhandleable_signals_are_rejected() {
        let client = Arc::new(Catcher::new(ExecutionMode::Hardware, false));
        let handler = BridgeSignalHandler::default();

        let err = register_signal(0, &handler, client.clone()).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert!(register_signal(BRIDGE_SIGKILL, &handler, client).is_err());
    }

    #[test]
    fn refused_delivery_is_an_error() {
        let signal = EnclaveSignal{signum: BRIDGE_SIGUSR1, code: 0, gregs: Vec::new()};

        let client = Catcher::new(ExecutionMode::Hardware, false);
        deliver(&client, &signal).unwrap();

        let blocked = Catcher{result: -1, ..Catcher::new(ExecutionMode::Hardware, false)};
        assert!(matches!(deliver(&blocked, &signal), Err(Error::Internal(_))));
        assert_eq!(blocked.seen.lock().unwrap().len(), 1);

        let not_ready = Catcher{result: 2, ..Catcher::new(ExecutionMode::Hardware, false)};
        assert!(deliver(&not_ready, &signal).is_err());
    }
}
