use crate::config::UpstreamConfig;
use crate::errors::SupervisorError;
use crate::supervisor::ProcessSupervisor;

/// Request-path surface for the reverse-proxy host.
///
/// The host calls [`ensure_running`](LazyUpstream::ensure_running) once per
/// inbound request and dials the returned address;
/// [`shutdown`](LazyUpstream::shutdown) is for teardown of the owning
/// configuration.
pub struct LazyUpstream {
    supervisor: ProcessSupervisor,
}

impl LazyUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self, SupervisorError> {
        Ok(Self {
            supervisor: ProcessSupervisor::new(config)?,
        })
    }

    /// Starts the process if needed, records activity, and returns the
    /// address to dial. Blocks for the duration of a cold start. Start
    /// failures propagate to the in-flight request and are not retried here;
    /// the next request triggers a fresh attempt.
    pub async fn ensure_running(&self) -> Result<String, SupervisorError> {
        self.supervisor.start().await?;

        if !self.supervisor.is_running() {
            return Err(SupervisorError::NoUpstream);
        }
        self.supervisor.record_activity();
        self.supervisor
            .dial_addr()
            .ok_or(SupervisorError::NoUpstream)
    }

    /// Unconditionally stops the supervised process.
    pub async fn shutdown(&self) {
        self.supervisor.stop().await;
    }

    /// Access to the underlying supervisor, e.g. for status reporting.
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }
}
