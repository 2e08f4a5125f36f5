//! Internal modules of the host runtime
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

pub(crate) mod dispatcher;
