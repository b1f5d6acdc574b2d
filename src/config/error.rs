// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the configuration module.

use std::io;
use thiserror::Error;

/// Errors that can occur while loading or reloading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An error occurred while parsing the YAML document.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// An IO error occurred while reading the configuration file.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}
