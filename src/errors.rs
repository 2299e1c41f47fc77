use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid upstream configuration: {0}")]
    InvalidConfig(String),
    #[error("preparation step failed: {0}")]
    PreparationFailed(String),
    #[error("failed to allocate an ephemeral port: {0}")]
    PortAllocation(#[source] io::Error),
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("no upstream available")]
    NoUpstream,
}
