//! A crate for building host applications around enclaves
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

mod internal;

/* Public interface */
pub mod builder;
pub mod enclave;
pub mod fork;
pub mod memory;
pub mod ocall;
pub mod signal;
pub mod sim;
pub mod socket;
pub mod syscall;
pub mod transmit;

pub use builder::{Builder, Host};
pub use internal::dispatcher::Dispatcher;
pub use ::edge::Status as Status;
pub use ::edge::Error  as Error;
