//! Module for establishing connections to dependencies that may not be reachable yet.
//!
//! Both daemons start next to the services they depend on. The [`Bootstrap`] routine keeps
//! trying a [`Connector`] with a fixed backoff until it yields a live handle or shutdown is
//! requested. There is no upper bound on attempts.
use std::time::Duration;

use async_trait::async_trait;

use crate::shutdown::Shutdown;

/// Opens connections to one external dependency.
#[async_trait]
pub trait Connector: Send + Sync
{
    /// Live connection handed out on success.
    type Handle: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Human readable description of the target, used in status messages.
    fn target(&self) -> String;

    /// Performs a single connection attempt.
    async fn connect(&self) -> Result<Self::Handle, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Connection lifecycle tracked by [`Bootstrap`].
pub enum ConnectionState
{
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
}

/// A handle returned by a successful bootstrap.
#[derive(Debug)]
pub struct Established<H>
{
    pub handle: H,
    /// Number of attempts that failed before the connection succeeded.
    pub failed_attempts: u32,
}

/// Retry-until-available connection routine.
pub struct Bootstrap<'a, C: Connector>
{
    connector: &'a C,
    backoff: Duration,
    shutdown: Shutdown,
    state: ConnectionState,
}

impl<'a, C: Connector> Bootstrap<'a, C>
{
    pub fn new(connector: &'a C, backoff: Duration, shutdown: Shutdown) -> Self {
        Self {
            connector,
            backoff,
            shutdown,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        log::trace!(target: "telemetryd::bootstrap", "{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Connects to the target, retrying after every failure.
    ///
    /// Every failed attempt is reported with a warning and followed by the backoff interval.
    ///
    /// # Returns
    ///
    /// * `Some(Established)` - The live handle and the number of failed attempts before it.
    ///
    /// * `None` - Shutdown was requested before a connection could be established.
    pub async fn establish(&mut self) -> Option<Established<C::Handle>> {
        let target = self.connector.target();
        let mut failed_attempts = 0;

        loop {
            if self.shutdown.is_triggered() {
                self.transition(ConnectionState::Disconnected);
                return None;
            }

            self.transition(ConnectionState::Connecting { attempt: failed_attempts + 1 });
            log::info!(target: "telemetryd::bootstrap", "Connecting to {}...", target);

            match self.connector.connect().await {
                Ok(handle) => {
                    self.transition(ConnectionState::Connected);
                    log::info!(target: "telemetryd::bootstrap", "Connected to {}!", target);
                    return Some(Established { handle, failed_attempts });
                }
                Err(err) => {
                    failed_attempts += 1;
                    self.transition(ConnectionState::Disconnected);
                    log::warn!(target: "telemetryd::bootstrap",
                               "{} not ready: \'{}\'. Retrying in {} seconds...",
                               target, err, self.backoff.as_secs_f32());
                }
            }

            if !self.shutdown.sleep(self.backoff).await {
                return None;
            }
        }
    }
}
