//! Secure fork where the child cannot reload the enclave at the parent's base
//!
//! Kept in its own binary so that the fork happens with no other test
//! threads running.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use eapp::{Application, Context, Server};
use edge::config::EnclaveConfig;
use edge::ecall::EnclaveEntry;
use edge::ocall::HostExit;
use happ::{Builder, Error, Host};
use happ::enclave::{EnclaveClient, EnclaveLoader, LoadConfig};
use happ::fork::ForkError;
use happ::memory::page_size;
use happ::sim::{LoadContext, SimLoader};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{getpid, Pid};

const NAME: &str = "relocated";

struct Echo;

impl Application for Echo {
    fn run(&self, _ctx: &Context, input: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(input.to_vec())
    }
}

/* Places every reload in a forked child away from the parent's base */
struct ShiftedLoader {
    inner: SimLoader,
}

impl EnclaveLoader for ShiftedLoader {
    fn load(&self, config: &LoadConfig, host: Arc<dyn HostExit>)
            -> Result<Arc<dyn EnclaveClient>, Error> {
        let mut config = config.clone();
        if let Some(fork) = config.fork_config.as_mut() {
            fork.base_address += 2 * fork.enclave_size;
        }
        self.inner.load(&config, host)
    }
}

fn host() -> Host {
    let inner = SimLoader::new(|ctx: &LoadContext| -> Result<Arc<dyn EnclaveEntry>, Error> {
        Ok(Arc::new(Server::with_application(Echo, ctx.host.clone(), ctx.layout.clone())))
    });
    let mut builder = Builder::new();
    builder.set_loader(ShiftedLoader{inner: inner});
    builder.build().unwrap()
}

fn exit_child<F: FnOnce() -> bool>(check: F) -> ! {
    let ok = catch_unwind(AssertUnwindSafe(check)).unwrap_or(false);
    unsafe { libc::_exit(if ok { 0 } else { 1 }) }
}

#[test]
fn relocated_child_enclave_is_refused() {
    let host = host();
    let mut config = EnclaveConfig::default();
    config.enable_fork = true;
    host.load_enclave(LoadConfig::new(NAME, 16 * page_size()).with_config(config)).unwrap();
    let parent = getpid();

    let result = host.fork(NAME, true);
    if getpid() != parent {
        exit_child(|| matches!(result, Err(ForkError::AddressMismatch{expected, actual})
                                       if expected != actual)
                      && host.get_client(NAME).is_none());
    }

    /* The parent learns of the failure through the broken key transfer */
    let err = result.unwrap_err();
    assert!(matches!(err, ForkError::KeyTransfer(_) | ForkError::Child(_)), "{:?}", err);
    assert_eq!(err.errno(), libc::EFAULT);

    match waitpid(Pid::from_raw(-1), None).unwrap() {
        WaitStatus::Exited(_, code) => assert_eq!(code, 0, "child failed its checks"),
        other                       => panic!("child ended with {:?}", other),
    }

    let client = host.get_client(NAME).unwrap();
    assert_eq!(client.enter_and_run(b"still here").unwrap(), b"still here");
    host.destroy_enclave(NAME, &[]).unwrap();
}
