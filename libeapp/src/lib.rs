//! A crate for writing the trusted side of enclave applications
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use log::error;

/* Public interface */
pub mod application;
pub mod crypto;
pub mod ecall;
pub mod ocall;
pub mod signal;
pub mod snapshot;

pub use application::{Application, Context, EnclaveState, TrustedApplication};
pub use ecall::Server;

pub use ::edge::Status as Status;
pub use ::edge::Error  as Error;

/// Terminate the enclave. The boundary cannot be trusted after this point.
pub(crate) fn enclave_abort(reason: &str) -> ! {
    error!("enclave abort: {}", reason);
    std::process::abort();
}
