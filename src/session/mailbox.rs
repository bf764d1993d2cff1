//! Bounded FIFO mailbox feeding the session controller.
//!
//! Uses an `embassy-sync` channel so producers on any thread (link receive
//! callbacks, the application, the retry timer) enqueue without blocking,
//! while the controller blocks with a timeout.
//!
//! ```text
//!   producers ──try_send──▶ Channel<Command, 10> ──receive/timeout──▶ controller
//! ```

use std::sync::Arc;
use std::time::Duration;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use futures_lite::future;

use super::command::Command;

pub const MAILBOX_DEPTH: usize = 10;

#[derive(Clone)]
pub struct Mailbox {
    channel: Arc<Channel<CriticalSectionRawMutex, Command, MAILBOX_DEPTH>>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            channel: Arc::new(Channel::new()),
        }
    }

    /// Enqueue without blocking. On a full mailbox the command comes back
    /// to the caller, who decides whether to retry or drop it.
    pub fn post(&self, cmd: Command) -> Result<(), Command> {
        self.channel.try_send(cmd).map_err(|e| match e {
            embassy_sync::channel::TrySendError::Full(cmd) => cmd,
        })
    }

    /// Block for the next command. `None` timeout waits forever; an elapsed
    /// timeout returns `None`.
    pub fn pend(&self, timeout: Option<Duration>) -> Option<Command> {
        match timeout {
            None => Some(future::block_on(self.channel.receive())),
            Some(after) => future::block_on(future::or(
                async { Some(self.channel.receive().await) },
                async {
                    async_io_mini::Timer::after(after).await;
                    None
                },
            )),
        }
    }

    pub fn try_pend(&self) -> Option<Command> {
        self.channel.try_receive().ok()
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }
}
