//! A common interface description for the trusted and untrusted sides of the
//! enclave boundary
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

mod error;

/* Public interface */
pub mod alloc;
pub mod bridge;
pub mod config;
pub mod ecall;
pub mod message;
pub mod ocall;
pub mod snapshot;

pub use error::{Error, Status};
