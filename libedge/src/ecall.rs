//! Entry selectors for calls from the host into the enclave
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use crate::Status;
use crate::alloc::BoundaryParams;

/// First selector available for user-defined entry points
pub const ECALL_USER_BASE: u64 = 0x100;

/// Selectors of the trusted runtime's own entry points
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum CallID {
    /// Load-time initialization with an `EnclaveConfig`
    Initialize                = 1,
    /// Run the user application
    Run                       = 2,
    /// Finalize the enclave
    Finalize                  = 3,
    /// Deliver a host signal
    DeliverSignal             = 4,
    /// Capture an encrypted memory snapshot
    TakeSnapshot              = 5,
    /// Restore memory from a snapshot
    Restore                   = 6,
    /// Send or receive the snapshot key over a socket
    TransferSecureSnapshotKey = 7,
}

impl CallID {
    pub fn as_u64(value: CallID) -> u64 {
        return value as u64;
    }

    pub fn from_u64(value: u64) -> Option<CallID> {
        return match value {
            1 => Some(CallID::Initialize),
            2 => Some(CallID::Run),
            3 => Some(CallID::Finalize),
            4 => Some(CallID::DeliverSignal),
            5 => Some(CallID::TakeSnapshot),
            6 => Some(CallID::Restore),
            7 => Some(CallID::TransferSecureSnapshotKey),
            _ => None,
        };
    }
}

/// Trusted side of an enclave, as seen by whoever enters it
pub trait EnclaveEntry: Send + Sync {

    /// Enter the enclave
    ///
    /// # Inputs
    /// * 'selector' identifies the entry point
    /// * 'params' carries the serialized arguments in; the callee takes the
    ///   input buffer and may leave a result buffer in `output`
    ///
    /// # Returns
    ///
    /// Status of the call. On failure the output, if any, holds an encoded
    /// `Error`.

    fn enter(&self, selector: u64, params: &mut BoundaryParams) -> Status;
}
