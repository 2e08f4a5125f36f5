//! Host-call API for serving calls from the enclave
//!
//! A `Listener` serves one selector. Its input is the decoded argument
//! message; whatever it pushes to `output` is returned to the enclave.
//! Closures and functions returning `Result<(), Error>` are listeners: an
//! error is encoded into the output and its status is returned.
//!
//! The built-in handlers in this module reply with the call result followed
//! by the bridge errno, then any payload. POSIX failures are reported in
//! band; only undecodable arguments fail the call itself.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::ffi::CString;
use std::io::Write;
use std::sync::Mutex;

use edge::bridge::signal::from_bridge_signal;
use edge::bridge::socket::BridgeSockAddr;
use edge::bridge::sys::{from_bridge_sysconf_name, to_bridge_errno, BridgePassWd,
                        BridgeUtsName};
use edge::bridge::syslog::{from_bridge_syslog_facility, from_bridge_syslog_options,
                           from_bridge_syslog_priority};
use edge::bridge::wait::{from_bridge_wait_options, BridgeRUsage, BridgeWStatus};
use edge::message::{MessageReader, MessageWriter, Scalar};
use lazy_static::lazy_static;
use log::{debug, warn};
use nix::errno::errno;

pub use edge::ocall::CallID;

use crate::{Error, Status};
use crate::syscall::SYSCALL_MAX_BUFFER;
use crate::transmit::Transmit;

/// Listener for host calls from the enclave
pub trait Listener: Send + Sync {

    /// This callback is called on each host call dispatched to the listener
    ///
    /// # Inputs
    /// * 'input' holds the call arguments
    /// * 'output' collects the results returned to the enclave
    ///
    /// # Returns
    ///
    /// Status value sent to the enclave application

    fn on_ocall(&self, input: &mut MessageReader, output: &mut MessageWriter) -> Status;
}

impl<F> Listener for F
    where F: Fn(&mut MessageReader, &mut MessageWriter) -> Result<(), Error> + Send + Sync
{
    fn on_ocall(&self, input: &mut MessageReader, output: &mut MessageWriter) -> Status {
        match self(input, output) {
            Ok(()) => Status::Success,
            Err(err) => {
                debug!("host call failed: {}", err);
                *output = MessageWriter::new();
                err.encode(output);
                err.status()
            },
        }
    }
}

lazy_static! {
    static ref TRANSMIT: Transmit = Transmit::new();
    /* openlog keeps the identifier pointer */
    static ref SYSLOG_IDENT: Mutex<Option<CString>> = Mutex::new(None);
}

/// Push a call result and the bridge errno observed right after the call
fn reply<T: Scalar>(output: &mut MessageWriter, rc: T) {
    let errno = to_bridge_errno(errno());
    output.push(rc);
    output.push(errno);
}

pub(crate) fn reply_error<T: Scalar>(output: &mut MessageWriter, rc: T, host_errno: i32) {
    output.push(rc);
    output.push(to_bridge_errno(host_errno));
}

/* The enclave picks the length, so it is bounded like a system call buffer */
fn receive_buffer(len: u64) -> Option<Vec<u8>> {
    if len > SYSCALL_MAX_BUFFER as u64 {
        warn!("receive buffer of {} bytes refused", len);
        return None;
    }
    Some(vec![0u8; len as usize])
}

fn c_string(value: String) -> Result<CString, Error> {
    CString::new(value).map_err(|_| Error::InvalidArgument("string with interior NUL".into()))
}

fn push_address(output: &mut MessageWriter,
                storage: &libc::sockaddr_storage,
                len: libc::socklen_t)
                -> Result<(), Error> {
    let addr = BridgeSockAddr::from_host(storage, len)?;
    output.push_bytes(&addr.to_bytes());
    Ok(())
}

fn on_isatty(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let fd = input.next::<i32>()?;
    reply(output, unsafe { libc::isatty(fd) });
    Ok(())
}

fn on_usleep(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let usec = input.next::<u32>()?;
    reply(output, unsafe { libc::usleep(usec) });
    Ok(())
}

fn on_sysconf(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let name = from_bridge_sysconf_name(input.next::<i32>()?);
    if name < 0 {
        reply_error(output, -1i64, libc::EINVAL);
        return Ok(());
    }

    reply(output, unsafe { libc::sysconf(name) } as i64);
    Ok(())
}

fn on_realloc(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let ptr  = input.next::<u64>()? as usize as *mut libc::c_void;
    let size = input.next::<u64>()? as usize;
    reply(output, unsafe { libc::realloc(ptr, size) } as usize as u64);
    Ok(())
}

fn on_sleep(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let seconds = input.next::<u32>()?;
    reply(output, unsafe { libc::sleep(seconds) });
    Ok(())
}

/// Arguments: fd, destination address (empty for none), data, flags
fn on_sendmsg(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let fd    = input.next::<i32>()?;
    let name  = input.next_bytes()?;
    let mut data = input.next_bytes()?;
    let flags = input.next::<i32>()?;

    let mut storage = None;
    if !name.is_empty() {
        storage = Some(BridgeSockAddr::from_bytes(&name)?.to_host()?);
    }

    let mut iov = libc::iovec{iov_base: data.as_mut_ptr() as *mut libc::c_void,
                              iov_len:  data.len()};
    let mut msg: libc::msghdr = unsafe { core::mem::zeroed() };
    msg.msg_iov    = &mut iov;
    msg.msg_iovlen = 1;
    if let Some((addr, len)) = storage.as_mut() {
        msg.msg_name    = addr as *mut libc::sockaddr_storage as *mut libc::c_void;
        msg.msg_namelen = *len;
    }

    match unsafe { TRANSMIT.send_msg(fd, &msg, flags) } {
        Ok(sent) => reply_error(output, sent as i64, 0),
        Err(err) => reply_error(output, -1i64, err.errno()),
    }
    Ok(())
}

/// Arguments: fd, buffer length, flags. Replies with the data, the source
/// address (empty for none) and the message flags.
fn on_recvmsg(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let fd    = input.next::<i32>()?;
    let len   = input.next::<u64>()?;
    let flags = input.next::<i32>()?;

    let mut data = match receive_buffer(len) {
        Some(data) => data,
        None       => {
            reply_error(output, -1i64, libc::EINVAL);
            return Ok(());
        },
    };
    let len = data.len();
    let mut storage: libc::sockaddr_storage = unsafe { core::mem::zeroed() };
    let mut iov = libc::iovec{iov_base: data.as_mut_ptr() as *mut libc::c_void,
                              iov_len:  data.len()};
    let mut msg: libc::msghdr = unsafe { core::mem::zeroed() };
    msg.msg_iov     = &mut iov;
    msg.msg_iovlen  = 1;
    msg.msg_name    = &mut storage as *mut libc::sockaddr_storage as *mut libc::c_void;
    msg.msg_namelen = core::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    match unsafe { TRANSMIT.recv_msg(fd, &mut msg, flags) } {
        Ok(received) => {
            reply_error(output, received as i64, 0);
            output.push_bytes(&data[.. received.min(len)]);
            if msg.msg_namelen > 0 {
                push_address(output, &storage, msg.msg_namelen)?;
            } else {
                output.push_empty();
            }
            output.push(msg.msg_flags);
        },
        Err(err) => reply_error(output, -1i64, err.errno()),
    }
    Ok(())
}

type AddressCall = unsafe extern "C" fn(i32, *mut libc::sockaddr, *mut libc::socklen_t) -> i32;

fn address_call(call: AddressCall,
                input: &mut MessageReader,
                output: &mut MessageWriter)
                -> Result<(), Error> {
    let fd = input.next::<i32>()?;
    let mut storage: libc::sockaddr_storage = unsafe { core::mem::zeroed() };
    let mut len = core::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { call(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    reply(output, rc);
    if rc >= 0 {
        push_address(output, &storage, len)?;
    }
    Ok(())
}

fn on_getsockname(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    address_call(libc::getsockname, input, output)
}

fn on_accept(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    address_call(libc::accept, input, output)
}

fn on_getpeername(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    address_call(libc::getpeername, input, output)
}

/// Arguments: fd, buffer length, flags. Replies with the data and the
/// source address.
fn on_recvfrom(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let fd    = input.next::<i32>()?;
    let len   = input.next::<u64>()?;
    let flags = input.next::<i32>()?;

    let mut data = match receive_buffer(len) {
        Some(data) => data,
        None       => {
            reply_error(output, -1i64, libc::EINVAL);
            return Ok(());
        },
    };
    let len = data.len();
    let mut storage: libc::sockaddr_storage = unsafe { core::mem::zeroed() };
    let mut addr_len = core::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::recvfrom(fd, data.as_mut_ptr() as *mut libc::c_void, len, flags,
                       &mut storage as *mut _ as *mut libc::sockaddr, &mut addr_len)
    };
    reply(output, rc as i64);
    if rc >= 0 {
        output.push_bytes(&data[.. rc as usize]);
        push_address(output, &storage, addr_len)?;
    }
    Ok(())
}

fn on_raise(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let signum = from_bridge_signal(input.next::<i32>()?);
    if signum < 0 {
        reply_error(output, -1i32, libc::EINVAL);
        return Ok(());
    }

    reply(output, unsafe { libc::raise(signum) });
    Ok(())
}

fn on_uname(_input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let mut uts: libc::utsname = unsafe { core::mem::zeroed() };
    let rc = unsafe { libc::uname(&mut uts) };
    reply(output, rc);
    if rc == 0 {
        BridgeUtsName::from_host(&uts).encode(output);
    }
    Ok(())
}

fn on_getpwuid(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let uid = input.next::<u32>()?;
    let mut pw: libc::passwd = unsafe { core::mem::zeroed() };
    let mut found: *mut libc::passwd = core::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let rc = unsafe {
        libc::getpwuid_r(uid, &mut pw, buf.as_mut_ptr(), buf.len(), &mut found)
    };

    if rc != 0 {
        reply_error(output, -1i32, rc);
    } else if found.is_null() {
        reply_error(output, -1i32, 0);
    } else {
        let entry = unsafe { BridgePassWd::from_host(&pw)? };
        reply_error(output, 0i32, 0);
        entry.encode(output);
    }
    Ok(())
}

fn on_wait3(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let options = from_bridge_wait_options(input.next::<i32>()?);
    let mut status = 0;
    let mut usage: libc::rusage = unsafe { core::mem::zeroed() };
    /* wait3 is wait4 on any child */
    let pid = unsafe { libc::wait4(-1, &mut status, options, &mut usage) };
    reply(output, pid);

    let wstatus = BridgeWStatus::from_host(status);
    output.push(wstatus.code);
    output.push(wstatus.info);
    BridgeRUsage::from_host(&usage).encode(output);
    Ok(())
}

fn on_waitpid(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let pid     = input.next::<i32>()?;
    let options = from_bridge_wait_options(input.next::<i32>()?);
    let mut status = 0;
    let rc = unsafe { libc::waitpid(pid, &mut status, options) };
    reply(output, rc);

    let wstatus = BridgeWStatus::from_host(status);
    output.push(wstatus.code);
    output.push(wstatus.info);
    Ok(())
}

fn on_openlog(input: &mut MessageReader, _output: &mut MessageWriter) -> Result<(), Error> {
    let ident    = c_string(input.next_string()?)?;
    let option   = from_bridge_syslog_options(input.next::<i32>()?);
    let facility = from_bridge_syslog_facility(input.next::<i32>()?);

    let mut slot = SYSLOG_IDENT.lock()
                               .map_err(|_| Error::Internal("syslog identifier lock".into()))?;
    let ident = slot.insert(ident);
    unsafe { libc::openlog(ident.as_ptr(), option, facility) };
    Ok(())
}

fn on_syslog(input: &mut MessageReader, _output: &mut MessageWriter) -> Result<(), Error> {
    let priority = from_bridge_syslog_priority(input.next::<i32>()?);
    let message  = c_string(input.next_string()?)?;
    unsafe { libc::syslog(priority, b"%s\0".as_ptr() as *const libc::c_char, message.as_ptr()) };
    Ok(())
}

fn on_debug_puts(input: &mut MessageReader, output: &mut MessageWriter) -> Result<(), Error> {
    let text = input.next_extent()?;
    let mut stdout = std::io::stdout().lock();
    let written = stdout.write_all(text)
                        .and_then(|_| stdout.write_all(b"\n"))
                        .and_then(|_| stdout.flush());
    match written {
        Ok(())   => reply_error(output, 0i32, 0),
        Err(err) => reply_error(output, -1i32, err.raw_os_error().unwrap_or(libc::EIO)),
    }
    Ok(())
}

/// Handlers served by every host, except the ones that need the enclave
/// manager
pub(crate) fn default_handlers() -> Vec<(CallID, Box<dyn Listener>)> {
    vec![entry(CallID::IsAtty,      on_isatty),
         entry(CallID::USleep,      on_usleep),
         entry(CallID::SysConf,     on_sysconf),
         entry(CallID::Realloc,     on_realloc),
         entry(CallID::Sleep,       on_sleep),
         entry(CallID::SendMsg,     on_sendmsg),
         entry(CallID::RecvMsg,     on_recvmsg),
         entry(CallID::GetSockname, on_getsockname),
         entry(CallID::Accept,      on_accept),
         entry(CallID::GetPeername, on_getpeername),
         entry(CallID::RecvFrom,    on_recvfrom),
         entry(CallID::Raise,       on_raise),
         entry(CallID::Uname,       on_uname),
         entry(CallID::GetPwUid,    on_getpwuid),
         entry(CallID::Wait3,       on_wait3),
         entry(CallID::WaitPid,     on_waitpid),
         entry(CallID::OpenLog,     on_openlog),
         entry(CallID::SysLog,      on_syslog),
         entry(CallID::DebugPuts,   on_debug_puts)]
}

fn entry<L: Listener + 'static>(id: CallID, listener: L) -> (CallID, Box<dyn Listener>) {
    (id, Box::new(listener))
}
