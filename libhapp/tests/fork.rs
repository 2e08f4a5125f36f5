//! Forking a simulated enclave with and without its memory
//!
//! Runs as a single test: forking while other test threads hold locks
//! would leave the child with those locks taken.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use eapp::{Application, Context, Server};
use eapp::ocall::errno;
use edge::config::EnclaveConfig;
use edge::ecall::EnclaveEntry;
use edge::snapshot::RegionKind;
use happ::{Builder, Error, Host};
use happ::enclave::{EnclaveClient, LoadConfig};
use happ::memory::page_size;
use happ::sim::{LoadContext, SimLoader};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{getpid, Pid};
use rand::RngCore;

const NAME: &str = "forked";

/* Keeps a random pattern in its heap and forks on request */
struct Pattern {
    pattern: Vec<u8>,
}

impl Application for Pattern {
    fn run(&self, ctx: &Context, input: &[u8]) -> Result<Vec<u8>, Error> {
        return match input {
            b"fill" => {
                ctx.write_region(RegionKind::Heap, page_size(), &self.pattern)?;
                Ok(Vec::new())
            },
            b"check" => {
                let heap = ctx.read_region(RegionKind::Heap, page_size(), self.pattern.len())?;
                Ok(vec![(heap == self.pattern) as u8])
            },
            b"fork" => {
                let pid = ctx.fork(true);
                if pid < 0 {
                    return Err(Error::posix(errno(), "fork"));
                }
                Ok(pid.to_le_bytes().to_vec())
            },
            _ => Err(Error::InvalidArgument("unknown command".into())),
        };
    }
}

fn host(pattern: &[u8]) -> Host {
    let pattern = pattern.to_vec();
    let mut builder = Builder::new();
    builder.set_loader(SimLoader::new(move |ctx: &LoadContext| -> Result<Arc<dyn EnclaveEntry>, Error> {
        let app = Pattern{pattern: pattern.clone()};
        Ok(Arc::new(Server::with_application(app, ctx.host.clone(), ctx.layout.clone())))
    }));
    builder.build().unwrap()
}

fn run(host: &Host, command: &[u8]) -> Vec<u8> {
    host.get_client(NAME).unwrap().enter_and_run(command).unwrap()
}

fn pattern_intact(host: &Host) -> bool {
    match host.get_client(NAME) {
        Some(client) => client.enter_and_run(b"check").map(|r| r == [1]).unwrap_or(false),
        None         => false,
    }
}

/* Never returns to the test harness in a child process */
fn exit_child<F: FnOnce() -> bool>(check: F) -> ! {
    let ok = catch_unwind(AssertUnwindSafe(check)).unwrap_or(false);
    unsafe { libc::_exit(if ok { 0 } else { 1 }) }
}

fn expect_clean_exit(pid: i32) {
    match waitpid(Pid::from_raw(pid), None).unwrap() {
        WaitStatus::Exited(_, code) => assert_eq!(code, 0, "child {} failed its checks", pid),
        other                       => panic!("child {} ended with {:?}", pid, other),
    }
}

#[test]
fn forked_children_keep_the_enclave_state() {
    let mut pattern = vec![0u8; 2 * page_size()];
    rand::thread_rng().fill_bytes(&mut pattern);

    let host = host(&pattern);
    let mut config = EnclaveConfig::default();
    config.enable_fork = true;
    let client = host.load_enclave(LoadConfig::new(NAME, 64 * page_size()).with_config(config))
                     .unwrap();
    let base = client.base_address();
    run(&host, b"fill");
    let parent = getpid();

    /* Plain fork: the child adopts the copied enclave */
    match host.fork(NAME, false) {
        Ok(0)   => exit_child(|| pattern_intact(&host)),
        Ok(pid) => expect_clean_exit(pid),
        Err(_) if getpid() != parent => exit_child(|| false),
        Err(err) => panic!("plain fork failed: {}", err),
    }

    /* Secure fork from the host: the child reloads and restores */
    match host.fork(NAME, true) {
        Ok(0)   => exit_child(|| {
            let client = host.get_client(NAME).unwrap();
            client.base_address() == base && pattern_intact(&host)
        }),
        Ok(pid) => expect_clean_exit(pid),
        Err(_) if getpid() != parent => exit_child(|| false),
        Err(err) => panic!("secure fork failed: {}", err),
    }

    /* Secure fork requested by the enclave itself */
    let reply = host.get_client(NAME).unwrap().enter_and_run(b"fork");
    if getpid() != parent {
        exit_child(|| reply.map(|pid| pid == 0i32.to_le_bytes()).unwrap_or(false)
                      && pattern_intact(&host));
    }
    let pid = i32::from_le_bytes(reply.unwrap().try_into().unwrap());
    assert!(pid > 0);
    expect_clean_exit(pid);

    assert!(pattern_intact(&host));
    host.destroy_enclave(NAME, &[]).unwrap();
}
