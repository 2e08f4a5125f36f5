//! Status codes and errors shared by both sides of the boundary
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use crate::message::{MessageReader, MessageWriter};

/// Numeric status returned with every boundary crossing
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    /// Call completed
    Success            = 0,
    /// Unspecified failure
    Error              = 1,
    /// No handler for the selector
    BadCallID          = 2,
    /// Argument rejected by the callee
    InvalidArgument    = 3,
    /// Callee is in the wrong state for the call
    FailedPrecondition = 4,
    /// Argument buffer could not be decoded
    Malformed          = 5,
    /// Boundary buffer could not be allocated
    OutOfMemory        = 6,
    /// Operating system call failed, errno attached
    PosixError         = 7,
    /// Peer closed the connection
    ConnectionClosed   = 8,
    /// Seal or open failed
    CryptoError        = 9,
    /// Callee hit an internal error
    InternalError      = 10,
    /// Any status value not listed above
    Unknown            = 0xffff,
}

impl Status {
    pub fn as_u32(value: Status) -> u32 {
        return value as u32;
    }

    pub fn from_u32(value: u32) -> Status {
        return match value {
            0  => Status::Success,
            1  => Status::Error,
            2  => Status::BadCallID,
            3  => Status::InvalidArgument,
            4  => Status::FailedPrecondition,
            5  => Status::Malformed,
            6  => Status::OutOfMemory,
            7  => Status::PosixError,
            8  => Status::ConnectionClosed,
            9  => Status::CryptoError,
            10 => Status::InternalError,
            _  => Status::Unknown,
        };
    }

    pub fn is_ok(&self) -> bool {
        *self == Status::Success
    }
}

/// Error type used on both sides of the boundary
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("no handler registered for selector {0:#x}")]
    BadSelector(u64),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("out of memory")]
    OutOfMemory,
    #[error("{context} failed with errno {errno}")]
    Posix { errno: i32, context: String },
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {

    /// Shorthand for a POSIX failure with context
    pub fn posix(errno: i32, context: &str) -> Self {
        Error::Posix{errno: errno, context: context.to_string()}
    }

    /// Boundary status matching this error
    pub fn status(&self) -> Status {
        return match self {
            Error::InvalidArgument(_)    => Status::InvalidArgument,
            Error::FailedPrecondition(_) => Status::FailedPrecondition,
            Error::BadSelector(_)        => Status::BadCallID,
            Error::Malformed(_)          => Status::Malformed,
            Error::OutOfMemory           => Status::OutOfMemory,
            Error::Posix{..}             => Status::PosixError,
            Error::ConnectionClosed      => Status::ConnectionClosed,
            Error::Crypto(_)             => Status::CryptoError,
            Error::Internal(_)           => Status::InternalError,
        };
    }

    /// Errno a POSIX-style caller observes for this error
    pub fn errno(&self) -> i32 {
        return match self {
            Error::InvalidArgument(_)    => libc::EINVAL,
            Error::FailedPrecondition(_) => libc::EPERM,
            Error::BadSelector(_)        => libc::ENOSYS,
            Error::Malformed(_)          => libc::EINVAL,
            Error::OutOfMemory           => libc::ENOMEM,
            Error::Posix{errno, ..}      => *errno,
            Error::ConnectionClosed      => libc::EPIPE,
            Error::Crypto(_)             => libc::EFAULT,
            Error::Internal(_)           => libc::EFAULT,
        };
    }

    /// Append the error to a message so it can cross the boundary
    pub fn encode(&self, writer: &mut MessageWriter) {
        writer.push(Status::as_u32(self.status()));
        writer.push(self.errno());
        writer.push_str(&self.detail());
    }

    /// Rebuild an error sent with `encode`
    ///
    /// A missing or truncated body still produces an error of the right
    /// kind, with a generic message.

    pub fn decode(status: Status, reader: &mut MessageReader) -> Self {
        let mut errno  = 0;
        let mut detail = String::from("no detail provided");
        if reader.remaining() >= 3 {
            let _ = reader.next::<u32>();
            errno  = reader.next::<i32>().unwrap_or(0);
            detail = reader.next_string().unwrap_or(detail);
        }

        return match status {
            Status::InvalidArgument    => Error::InvalidArgument(detail),
            Status::FailedPrecondition => Error::FailedPrecondition(detail),
            Status::BadCallID          => Error::BadSelector(0),
            Status::Malformed          => Error::Malformed(detail),
            Status::OutOfMemory        => Error::OutOfMemory,
            Status::PosixError         => Error::Posix{errno: errno, context: detail},
            Status::ConnectionClosed   => Error::ConnectionClosed,
            Status::CryptoError        => Error::Crypto(detail),
            _                          => Error::Internal(detail),
        };
    }

    fn detail(&self) -> String {
        return match self {
            Error::InvalidArgument(s)    => s.clone(),
            Error::FailedPrecondition(s) => s.clone(),
            Error::Malformed(s)          => s.clone(),
            Error::Posix{context, ..}    => context.clone(),
            Error::Crypto(s)             => s.clone(),
            Error::Internal(s)           => s.clone(),
            other                        => other.to_string(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_survive_numeric_form() {
        for status in [Status::Success, Status::BadCallID, Status::PosixError,
                       Status::InternalError] {
            assert_eq!(Status::from_u32(Status::as_u32(status)), status);
        }
        assert_eq!(Status::from_u32(4242), Status::Unknown);
    }

    #[test]
    fn error_crosses_boundary_with_detail() {
        let err = Error::FailedPrecondition("Enclave not initialized".into());
        let mut writer = MessageWriter::new();
        err.encode(&mut writer);

        let mut reader = MessageReader::deserialize(&writer.to_bytes()).unwrap();
        let decoded = Error::decode(err.status(), &mut reader);
        assert_eq!(decoded, err);
    }

    #[test]
    fn posix_error_keeps_errno() {
        let err = Error::posix(libc::EAGAIN, "fork");
        let mut writer = MessageWriter::new();
        err.encode(&mut writer);

        let mut reader = MessageReader::deserialize(&writer.to_bytes()).unwrap();
        let decoded = Error::decode(Status::PosixError, &mut reader);
        assert_eq!(decoded.errno(), libc::EAGAIN);
    }
}
