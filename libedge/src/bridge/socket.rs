//! Address families, socket types and socket addresses
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use core::mem::size_of;

use super::{Table, bits_from_bridge, bits_to_bridge, const_from_bridge, const_to_bridge};
use crate::Error;
use crate::message::{MessageReader, MessageWriter};

pub const BRIDGE_AF_UNSPEC: i32 = 0;
pub const BRIDGE_AF_UNIX:   i32 = 1;
pub const BRIDGE_AF_INET:   i32 = 2;
pub const BRIDGE_AF_INET6:  i32 = 3;

pub(crate) const FAMILY_TABLE: &Table = &[
    (BRIDGE_AF_UNSPEC as i64, libc::AF_UNSPEC as i64),
    (BRIDGE_AF_UNIX as i64,   libc::AF_UNIX as i64),
    (BRIDGE_AF_INET as i64,   libc::AF_INET as i64),
    (BRIDGE_AF_INET6 as i64,  libc::AF_INET6 as i64),
];

/// Translate a host address family, -1 when unsupported
pub fn to_bridge_family(host: i32) -> i32 {
    const_to_bridge(host as i64, FAMILY_TABLE, -1) as i32
}

pub fn from_bridge_family(bridge: i32) -> i32 {
    const_from_bridge(bridge as i64, FAMILY_TABLE, -1) as i32
}

pub const BRIDGE_SOCK_STREAM:    i32 = 1;
pub const BRIDGE_SOCK_DGRAM:     i32 = 2;
pub const BRIDGE_SOCK_SEQPACKET: i32 = 3;
pub const BRIDGE_SOCK_RAW:       i32 = 4;
pub const BRIDGE_SOCK_NONBLOCK:  i32 = 0x100;
pub const BRIDGE_SOCK_CLOEXEC:   i32 = 0x200;

const BRIDGE_SOCK_TYPE_MASK: i32 = 0xff;

pub(crate) const TYPE_TABLE: &Table = &[
    (BRIDGE_SOCK_STREAM as i64,    libc::SOCK_STREAM as i64),
    (BRIDGE_SOCK_DGRAM as i64,     libc::SOCK_DGRAM as i64),
    (BRIDGE_SOCK_SEQPACKET as i64, libc::SOCK_SEQPACKET as i64),
    (BRIDGE_SOCK_RAW as i64,       libc::SOCK_RAW as i64),
];

pub(crate) const TYPE_FLAG_TABLE: &Table = &[
    (BRIDGE_SOCK_NONBLOCK as i64, libc::SOCK_NONBLOCK as i64),
    (BRIDGE_SOCK_CLOEXEC as i64,  libc::SOCK_CLOEXEC as i64),
];

/// Translate a host socket type with its flags, -1 for an unknown type
pub fn to_bridge_socket_type(host: i32) -> i32 {
    let flags = libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    let kind  = const_to_bridge((host & !flags) as i64, TYPE_TABLE, -1) as i32;
    if kind < 0 {
        return -1;
    }
    kind | bits_to_bridge((host & flags) as i64, TYPE_FLAG_TABLE) as i32
}

pub fn from_bridge_socket_type(bridge: i32) -> i32 {
    let kind = const_from_bridge((bridge & BRIDGE_SOCK_TYPE_MASK) as i64, TYPE_TABLE, -1) as i32;
    if kind < 0 {
        return -1;
    }
    kind | bits_from_bridge((bridge & !BRIDGE_SOCK_TYPE_MASK) as i64, TYPE_FLAG_TABLE) as i32
}

/// Maximum unix socket path, including the terminator
pub const BRIDGE_UNIX_PATH_MAX: usize = 108;

/// Bridge socket address
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeSockAddr {
    Unspec,
    /// Unix domain path, without terminator; a leading zero byte makes it
    /// an abstract address
    Unix { path: Vec<u8> },
    /// IPv4, port and address in host order
    Inet { port: u16, addr: [u8; 4] },
    /// IPv6, port in host order
    Inet6 { port: u16, flowinfo: u32, addr: [u8; 16], scope_id: u32 },
}

impl BridgeSockAddr {

    /// Bridge address family of the value
    pub fn family(&self) -> i32 {
        return match self {
            BridgeSockAddr::Unspec     => BRIDGE_AF_UNSPEC,
            BridgeSockAddr::Unix{..}   => BRIDGE_AF_UNIX,
            BridgeSockAddr::Inet{..}   => BRIDGE_AF_INET,
            BridgeSockAddr::Inet6{..}  => BRIDGE_AF_INET6,
        };
    }

    /// Build the host socket address
    ///
    /// # Returns
    ///
    /// The address and its length, or Err(Error::InvalidArgument) for a unix
    /// path that does not fit

    pub fn to_host(&self) -> Result<(libc::sockaddr_storage, libc::socklen_t), Error> {
        let mut storage: libc::sockaddr_storage = unsafe { core::mem::zeroed() };
        let len = match self {
            BridgeSockAddr::Unspec => {
                storage.ss_family = libc::AF_UNSPEC as libc::sa_family_t;
                size_of::<libc::sa_family_t>()
            }
            BridgeSockAddr::Unix{path} => {
                let abstract_name = path.first() == Some(&0);
                let needed = if abstract_name { path.len() } else { path.len() + 1 };
                if needed > BRIDGE_UNIX_PATH_MAX {
                    return Err(Error::InvalidArgument("unix socket path too long".into()));
                }

                let un = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_un) };
                un.sun_family = libc::AF_UNIX as libc::sa_family_t;
                for (dst, src) in un.sun_path.iter_mut().zip(path.iter()) {
                    *dst = *src as libc::c_char;
                }
                sun_path_offset() + needed
            }
            BridgeSockAddr::Inet{port, addr} => {
                let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port   = port.to_be();
                sin.sin_addr   = libc::in_addr{s_addr: u32::from_ne_bytes(*addr)};
                size_of::<libc::sockaddr_in>()
            }
            BridgeSockAddr::Inet6{port, flowinfo, addr, scope_id} => {
                let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
                sin6.sin6_family   = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port     = port.to_be();
                sin6.sin6_flowinfo = flowinfo.to_be();
                sin6.sin6_addr     = libc::in6_addr{s6_addr: *addr};
                sin6.sin6_scope_id = *scope_id;
                size_of::<libc::sockaddr_in6>()
            }
        };

        Ok((storage, len as libc::socklen_t))
    }

    /// Read a host socket address of `len` bytes
    ///
    /// # Returns
    ///
    /// The bridge address, or Err(Error::Posix) with EAFNOSUPPORT for a
    /// family the bridge does not carry

    pub fn from_host(storage: &libc::sockaddr_storage, len: libc::socklen_t)
                     -> Result<Self, Error> {
        let len = (len as usize).min(size_of::<libc::sockaddr_storage>());
        if len < size_of::<libc::sa_family_t>() {
            return Ok(BridgeSockAddr::Unspec);
        }

        return match storage.ss_family as i32 {
            libc::AF_UNSPEC => Ok(BridgeSockAddr::Unspec),
            libc::AF_UNIX => {
                let un = unsafe { &*(storage as *const _ as *const libc::sockaddr_un) };
                let count = len.saturating_sub(sun_path_offset()).min(un.sun_path.len());
                let mut path: Vec<u8> = un.sun_path[.. count].iter().map(|c| *c as u8).collect();
                if path.first() != Some(&0) {
                    if let Some(end) = path.iter().position(|b| *b == 0) {
                        path.truncate(end);
                    }
                }
                Ok(BridgeSockAddr::Unix{path: path})
            }
            libc::AF_INET => {
                let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                Ok(BridgeSockAddr::Inet{port: u16::from_be(sin.sin_port),
                                        addr: sin.sin_addr.s_addr.to_ne_bytes()})
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                Ok(BridgeSockAddr::Inet6{port:     u16::from_be(sin6.sin6_port),
                                         flowinfo: u32::from_be(sin6.sin6_flowinfo),
                                         addr:     sin6.sin6_addr.s6_addr,
                                         scope_id: sin6.sin6_scope_id})
            }
            family => Err(Error::posix(libc::EAFNOSUPPORT,
                                       &format!("socket address family {}", family))),
        };
    }

    pub fn encode(&self, writer: &mut MessageWriter) {
        writer.push(self.family());
        match self {
            BridgeSockAddr::Unspec => {}
            BridgeSockAddr::Unix{path} => writer.push_bytes(path),
            BridgeSockAddr::Inet{port, addr} => {
                writer.push(*port);
                writer.push_bytes(addr);
            }
            BridgeSockAddr::Inet6{port, flowinfo, addr, scope_id} => {
                writer.push(*port);
                writer.push(*flowinfo);
                writer.push_bytes(addr);
                writer.push(*scope_id);
            }
        }
    }

    pub fn decode(reader: &mut MessageReader) -> Result<Self, Error> {
        return match reader.next::<i32>()? {
            BRIDGE_AF_UNSPEC => Ok(BridgeSockAddr::Unspec),
            BRIDGE_AF_UNIX   => Ok(BridgeSockAddr::Unix{path: reader.next_bytes()?}),
            BRIDGE_AF_INET   => {
                let port = reader.next::<u16>()?;
                let addr = fixed::<4>(reader.next_extent()?)?;
                Ok(BridgeSockAddr::Inet{port: port, addr: addr})
            }
            BRIDGE_AF_INET6  => {
                let port     = reader.next::<u16>()?;
                let flowinfo = reader.next::<u32>()?;
                let addr     = fixed::<16>(reader.next_extent()?)?;
                let scope_id = reader.next::<u32>()?;
                Ok(BridgeSockAddr::Inet6{port: port, flowinfo: flowinfo,
                                         addr: addr, scope_id: scope_id})
            }
            family => Err(Error::Malformed(format!("socket address family {}", family))),
        };
    }

    /// Encode as a single extent
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = MessageWriter::new();
        self.encode(&mut writer);
        writer.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = MessageReader::deserialize(bytes)?;
        Self::decode(&mut reader)
    }
}

fn sun_path_offset() -> usize {
    size_of::<libc::sa_family_t>()
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], Error> {
    bytes.try_into()
         .map_err(|_| Error::Malformed(format!("expected {} address bytes", N)))
}
