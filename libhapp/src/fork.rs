//! Secure fork of a running enclave
//!
//! Without state preservation this is a plain `fork()` after which the
//! child adopts the enclave. With state preservation the parent takes an
//! encrypted snapshot, forks, and the child reloads the enclave at the same
//! base address, receives the snapshot key over a socket pair and restores
//! memory. The child reports the outcome over a pipe; the parent waits for
//! it with a timeout.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Weak;
use std::time::Duration;

use edge::message::{MessageReader, MessageWriter};
use edge::snapshot::{ForkHandshakeConfig, SnapshotLayout};
use log::{error, info, warn};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::time::{TimeVal, TimeValLike};
use nix::unistd::{pipe, ForkResult};

use crate::Error;
use crate::enclave::{EnclaveManager, ForkConfig};
use crate::ocall::{reply_error, Listener};
use crate::transmit::Transmit;

/// How long the parent waits for the child's status
pub const FORK_TIMEOUT: Duration = Duration::from_secs(5);

/// Status the child sends when the enclave is restored
pub const CHILD_FORK_SUCCEEDED: &str = "Child fork succeeded";

const CHILD_RELOAD_FAILED:   &str = "Child enclave reload failed";
const CHILD_ADDRESS_CHANGED: &str = "Child enclave base address changed";
const CHILD_KEY_FAILED:      &str = "Child DoSnapshotKeyTransfer failed";
const CHILD_RESTORE_FAILED:  &str = "Child EnterAndRestore failed";

const STATUS_BUFFER_SIZE: usize = 64;

/// Fork failures
#[derive(thiserror::Error, Debug)]
pub enum ForkError {
    #[error("no enclave named {0}")]
    UnknownEnclave(String),
    #[error("taking the snapshot failed: {0}")]
    Snapshot(Error),
    #[error("creating the fork channels failed: {0}")]
    Channel(Errno),
    #[error("fork failed: {0}")]
    Fork(Errno),
    #[error("reloading the enclave in the child failed: {0}")]
    Reload(Error),
    #[error("child enclave at {actual:#x}, parent enclave at {expected:#x}")]
    AddressMismatch { expected: usize, actual: usize },
    #[error("snapshot key transfer failed: {0}")]
    KeyTransfer(Error),
    #[error("restoring the snapshot failed: {0}")]
    Restore(Error),
    #[error("no status from the child within {0:?}")]
    Timeout(Duration),
    #[error("reading the child status failed: {0}")]
    Status(Error),
    #[error("child reported: {0}")]
    Child(String),
}

impl ForkError {

    /// Errno reported to the enclave for this failure
    pub fn errno(&self) -> i32 {
        return match self {
            ForkError::UnknownEnclave(_)    => libc::EINVAL,
            ForkError::Snapshot(_)          => libc::ENOMEM,
            ForkError::Channel(_)           => libc::EFAULT,
            ForkError::Fork(errno)          => *errno as i32,
            ForkError::Reload(_)            => libc::ENOMEM,
            ForkError::AddressMismatch{..}  => libc::EAGAIN,
            ForkError::KeyTransfer(_)       => libc::EFAULT,
            ForkError::Restore(_)           => libc::EAGAIN,
            ForkError::Timeout(_)           => libc::EFAULT,
            ForkError::Status(_)            => libc::EFAULT,
            ForkError::Child(_)             => libc::EFAULT,
        };
    }
}

/// Fork the process, optionally carrying the enclave's state to the child
///
/// # Inputs
/// * 'manager' owns the enclave
/// * 'name' is the enclave to duplicate
/// * 'restore_snapshot' carries enclave memory over to the child
///
/// # Returns
///
/// The child's pid in the parent, 0 in the child, or the failure

pub fn fork(manager: &EnclaveManager, name: &str, restore_snapshot: bool) -> Result<i32, ForkError> {
    let client = manager.get_client(name)
                        .ok_or_else(|| ForkError::UnknownEnclave(name.to_string()))?;

    if !restore_snapshot {
        return match unsafe { nix::unistd::fork() }.map_err(ForkError::Fork)? {
            ForkResult::Child => {
                client.set_process_id();
                Ok(0)
            },
            ForkResult::Parent{child} => Ok(child.as_raw()),
        };
    }

    let mut config = manager.get_load_config(name)
                            .ok_or_else(|| ForkError::UnknownEnclave(name.to_string()))?;
    let base = client.base_address();
    let size = client.enclave_size();

    /* Both processes own a copy of the buffers after fork and free their own */
    let snapshot = client.enter_and_take_snapshot().map_err(ForkError::Snapshot)?;

    /* [0] is the child's end, [1] the parent's */
    let (child_end, parent_end) = socketpair(AddressFamily::Unix, SockType::Stream, None,
                                             SockFlag::empty())
                                             .map_err(ForkError::Channel)?;
    let child_end  = unsafe { OwnedFd::from_raw_fd(child_end) };
    let parent_end = unsafe { OwnedFd::from_raw_fd(parent_end) };
    let (status_read, status_write) = pipe().map_err(ForkError::Channel)?;
    let status_read  = unsafe { OwnedFd::from_raw_fd(status_read) };
    let status_write = unsafe { OwnedFd::from_raw_fd(status_write) };

    match unsafe { nix::unistd::fork() }.map_err(ForkError::Fork)? {
        ForkResult::Child => {
            drop(status_read);
            drop(parent_end);

            config.fork_config = Some(ForkConfig{base_address: base, enclave_size: size});
            let result = restore_in_child(manager, config, base, child_end.as_raw_fd(), &snapshot);
            let status = match &result {
                Ok(())                              => CHILD_FORK_SUCCEEDED,
                Err(ForkError::AddressMismatch{..}) => CHILD_ADDRESS_CHANGED,
                Err(ForkError::KeyTransfer(_))      => CHILD_KEY_FAILED,
                Err(ForkError::Restore(_))          => CHILD_RESTORE_FAILED,
                Err(_)                              => CHILD_RELOAD_FAILED,
            };
            if let Err(err) = Transmit::new().write(status_write.as_raw_fd(), status.as_bytes()) {
                error!("child could not report fork status: {}", err);
            }

            result.map(|_| 0)
        },
        ForkResult::Parent{child} => {
            drop(status_write);
            drop(child_end);

            let handshake = ForkHandshakeConfig{is_parent: true, socket: parent_end.as_raw_fd()};
            client.enter_and_transfer_secure_snapshot_key(&handshake)
                  .map_err(|err| {
                      error!("parent snapshot key transfer failed: {}", err);
                      ForkError::KeyTransfer(err)
                  })?;

            wait_for_child_status(status_read.as_raw_fd(), FORK_TIMEOUT)?;
            info!("enclave {} forked into process {}", name, child.as_raw());
            Ok(child.as_raw())
        },
    }
}

fn restore_in_child(manager: &EnclaveManager,
                    config: crate::enclave::LoadConfig,
                    base: usize,
                    socket: RawFd,
                    snapshot: &SnapshotLayout)
                    -> Result<(), ForkError> {

    let name = config.name.clone();
    let client = manager.load_enclave(config).map_err(ForkError::Reload)?;
    if client.base_address() != base {
        error!("child enclave loaded at {:#x}, expected {:#x}", client.base_address(), base);
        if let Err(err) = manager.destroy_enclave(&name, &[], true) {
            warn!("dropping misplaced enclave {} failed: {}", name, err);
        }
        return Err(ForkError::AddressMismatch{expected: base, actual: client.base_address()});
    }

    let handshake = ForkHandshakeConfig{is_parent: false, socket: socket};
    client.enter_and_transfer_secure_snapshot_key(&handshake)
          .map_err(ForkError::KeyTransfer)?;
    client.enter_and_restore(snapshot).map_err(ForkError::Restore)?;
    Ok(())
}

/// Wait for the child's status on the read end of the status pipe
///
/// # Inputs
/// * 'fd' is the read end of the pipe
/// * 'timeout' bounds the wait
///
/// # Returns
///
/// Ok() only if the child sent exactly `CHILD_FORK_SUCCEEDED`

pub fn wait_for_child_status(fd: RawFd, timeout: Duration) -> Result<(), ForkError> {
    let mut remaining = TimeVal::milliseconds(timeout.as_millis() as i64);
    loop {
        let mut readable = FdSet::new();
        readable.insert(fd);
        /* Linux leaves the unslept time in `remaining` */
        match select(fd + 1, Some(&mut readable), None::<&mut FdSet>, None::<&mut FdSet>,
                     Some(&mut remaining)) {
            Ok(0)             => return Err(ForkError::Timeout(timeout)),
            Ok(_)             => break,
            Err(Errno::EINTR) => continue,
            Err(errno)        => return Err(ForkError::Status(Error::posix(errno as i32, "select"))),
        }
    }

    let mut buf = [0u8; STATUS_BUFFER_SIZE];
    let len = loop {
        match nix::unistd::read(fd, &mut buf) {
            Ok(len)           => break len,
            Err(Errno::EINTR) => continue,
            Err(errno)        => return Err(ForkError::Status(Error::posix(errno as i32, "read"))),
        }
    };
    if len == 0 {
        return Err(ForkError::Status(Error::ConnectionClosed));
    }

    let status = &buf[.. len];
    if status != CHILD_FORK_SUCCEEDED.as_bytes() {
        let message = String::from_utf8_lossy(status).into_owned();
        error!("{}", message);
        return Err(ForkError::Child(message));
    }
    Ok(())
}

/// Listener for `CallID::Fork`
///
/// Arguments: enclave name, whether to restore the snapshot.
/// Reply: pid (or -1) and bridge errno.

pub(crate) fn fork_listener(manager: Weak<EnclaveManager>) -> Box<dyn Listener> {
    Box::new(move |input: &mut MessageReader, output: &mut MessageWriter| -> Result<(), Error> {
        let name = input.next_string()?;
        let restore_snapshot = input.next::<bool>()?;
        let manager = manager.upgrade()
                             .ok_or_else(|| Error::FailedPrecondition("host runtime is gone".into()))?;

        match fork(&manager, &name, restore_snapshot) {
            Ok(pid) => reply_error(output, pid, 0),
            Err(err) => {
                error!("fork of enclave {} failed: {}", name, err);
                reply_error(output, -1i32, err.errno());
            },
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    fn status_pipe() -> (OwnedFd, OwnedFd) {
        let (read, write) = pipe().unwrap();
        unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) }
    }

    #[test]
    fn success_marker_is_accepted() {
        let (read, write) = status_pipe();
        Transmit::new().write(write.as_raw_fd(), CHILD_FORK_SUCCEEDED.as_bytes()).unwrap();
        wait_for_child_status(read.as_raw_fd(), FORK_TIMEOUT).unwrap();
    }

    #[test]
    fn failure_string_is_reported() {
        let (read, write) = status_pipe();
        Transmit::new().write(write.as_raw_fd(), CHILD_RESTORE_FAILED.as_bytes()).unwrap();
        match wait_for_child_status(read.as_raw_fd(), FORK_TIMEOUT) {
            Err(ForkError::Child(message)) => assert_eq!(message, CHILD_RESTORE_FAILED),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn marker_prefix_is_not_success() {
        let (read, write) = status_pipe();
        Transmit::new().write(write.as_raw_fd(), b"Child fork succeeded!").unwrap();
        assert!(wait_for_child_status(read.as_raw_fd(), FORK_TIMEOUT).is_err());
    }

    #[test]
    fn closed_pipe_is_a_failure() {
        let (read, write) = status_pipe();
        drop(write);
        assert!(matches!(wait_for_child_status(read.as_raw_fd(), FORK_TIMEOUT),
                         Err(ForkError::Status(Error::ConnectionClosed))));
    }

    #[test]
    fn silent_child_times_out() {
        let (read, _write) = status_pipe();
        let start = Instant::now();
        let err = wait_for_child_status(read.as_raw_fd(), FORK_TIMEOUT).unwrap_err();
        assert!(matches!(err, ForkError::Timeout(_)));
        assert_eq!(err.errno(), libc::EFAULT);
        assert!(start.elapsed() >= Duration::from_millis(4900));
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(ForkError::Snapshot(Error::OutOfMemory).errno(), libc::ENOMEM);
        assert_eq!(ForkError::AddressMismatch{expected: 1, actual: 2}.errno(), libc::EAGAIN);
        assert_eq!(ForkError::Restore(Error::Crypto("tag".into())).errno(), libc::EAGAIN);
        assert_eq!(ForkError::KeyTransfer(Error::ConnectionClosed).errno(), libc::EFAULT);
    }
}
