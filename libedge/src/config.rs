//! Enclave configuration passed at initialization
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use crate::Error;
use crate::message::{MessageReader, MessageWriter};

/// An environment variable to install before user initialization.
/// Both fields are required; they are optional here so that an incomplete
/// entry can be represented and rejected by the enclave.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvironmentVariable {
    pub name:  Option<String>,
    pub value: Option<String>,
}

impl EnvironmentVariable {
    pub fn new(name: &str, value: &str) -> Self {
        Self{name: Some(name.to_string()), value: Some(value.to_string())}
    }
}

/// Logging settings for the enclave
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Directory for log files, empty for the default
    pub log_directory: String,
    /// Verbosity 0 (errors) to 4 (trace); negative leaves the level as is
    pub vlog_level:    i32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self{log_directory: String::new(), vlog_level: -1}
    }
}

/// Configuration of one enclave instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnclaveConfig {
    pub environment_variables: Vec<EnvironmentVariable>,
    /// Allows snapshot and restore, which fork depends on
    pub enable_fork:           bool,
    pub logging:               LoggingConfig,
    /// Host descriptors for stdio, -1 when not provided
    pub stdin_fd:              i32,
    pub stdout_fd:             i32,
    pub stderr_fd:             i32,
    /// Initial working directory, empty to keep the host's
    pub current_working_directory: String,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self{environment_variables:     Vec::new(),
             enable_fork:               false,
             logging:                   LoggingConfig::default(),
             stdin_fd:                  -1,
             stdout_fd:                 -1,
             stderr_fd:                 -1,
             current_working_directory: String::new()}
    }
}

impl EnclaveConfig {

    pub fn encode(&self, writer: &mut MessageWriter) {
        writer.push(self.environment_variables.len() as u32);
        for var in &self.environment_variables {
            push_optional(writer, &var.name);
            push_optional(writer, &var.value);
        }
        writer.push(self.enable_fork);
        writer.push_str(&self.logging.log_directory);
        writer.push(self.logging.vlog_level);
        writer.push(self.stdin_fd);
        writer.push(self.stdout_fd);
        writer.push(self.stderr_fd);
        writer.push_str(&self.current_working_directory);
    }

    pub fn decode(reader: &mut MessageReader) -> Result<Self, Error> {
        let count = reader.next::<u32>()? as usize;
        let mut vars = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0 .. count {
            let name  = next_optional(reader)?;
            let value = next_optional(reader)?;
            vars.push(EnvironmentVariable{name: name, value: value});
        }

        Ok(Self{environment_variables: vars,
                enable_fork:           reader.next()?,
                logging:               LoggingConfig{log_directory: reader.next_string()?,
                                                     vlog_level:    reader.next()?},
                stdin_fd:              reader.next()?,
                stdout_fd:             reader.next()?,
                stderr_fd:             reader.next()?,
                current_working_directory: reader.next_string()?})
    }
}

fn push_optional(writer: &mut MessageWriter, value: &Option<String>) {
    writer.push(value.is_some());
    writer.push_str(value.as_deref().unwrap_or(""));
}

fn next_optional(reader: &mut MessageReader) -> Result<Option<String>, Error> {
    let present = reader.next::<bool>()?;
    let value   = reader.next_string()?;
    Ok(if present { Some(value) } else { None })
}
