//! Simulation errors

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("client {client} saw no {what} within {after:?}")]
    Timeout {
        client: String,
        what: String,
        after: Duration,
    },
}
