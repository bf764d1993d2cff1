//! Retry timer adapter.
//!
//! Implements [`RetryTimer`] with a small task that owns one deadline.
//! `arm`/`cancel` are forwarded over a channel; on expiry the task posts
//! [`Command::ConnectRadio`] to the session mailbox and never touches
//! session state itself.
//!
//! ```text
//!   controller ──Arm/Cancel──▶ Channel<TimerRequest, 4> ──▶ timer task
//!   timer task ──ConnectRadio──▶ Mailbox ──▶ controller
//! ```

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use futures_lite::future;
use log::{debug, info, warn};

use crate::app::ports::RetryTimer;
use crate::session::command::Command;
use crate::session::mailbox::Mailbox;
use crate::task::{self, Core};

const REQUEST_DEPTH: usize = 4;
const TIMER_TASK_PRIORITY: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerRequest {
    Arm(Duration),
    Cancel,
}

type Requests = Channel<CriticalSectionRawMutex, TimerRequest, REQUEST_DEPTH>;

pub struct MailboxTimer {
    requests: Arc<Requests>,
    /// An `Arm` was sent with no `Cancel` after it. Expiry is not tracked;
    /// a cancel after expiry is a no-op in the task.
    armed: bool,
}

impl MailboxTimer {
    /// Spawn the timer task feeding `mailbox`.
    pub fn spawn(mailbox: Mailbox, stack_kb: usize) -> io::Result<Self> {
        let requests = Arc::new(Requests::new());
        let rx = Arc::clone(&requests);
        task::spawn_on_core(
            Core::Pro,
            TIMER_TASK_PRIORITY,
            stack_kb,
            "retry-timer\0",
            move || future::block_on(timer_loop(&rx, &mailbox)),
        )?;
        Ok(Self {
            requests,
            armed: false,
        })
    }

    fn request(&self, req: TimerRequest) {
        if self.requests.try_send(req).is_err() {
            warn!("Backoff: timer request {req:?} dropped, queue full");
        }
    }
}

impl RetryTimer for MailboxTimer {
    fn arm(&mut self, after: Duration) {
        self.armed = true;
        self.request(TimerRequest::Arm(after));
    }

    fn cancel(&mut self) {
        if std::mem::take(&mut self.armed) {
            self.request(TimerRequest::Cancel);
        }
    }
}

async fn timer_loop(requests: &Requests, mailbox: &Mailbox) {
    let mut deadline: Option<Instant> = None;
    loop {
        let next = match deadline {
            None => Some(requests.receive().await),
            Some(at) => {
                future::or(async { Some(requests.receive().await) }, async {
                    Timer::after(at.saturating_duration_since(Instant::now())).await;
                    None
                })
                .await
            }
        };

        match next {
            Some(TimerRequest::Arm(after)) => {
                debug!("Backoff: retry timer armed for {}s", after.as_secs());
                deadline = Some(Instant::now() + after);
            }
            Some(TimerRequest::Cancel) => deadline = None,
            None => {
                deadline = None;
                info!("Backoff: retry timer expired");
                if let Err(cmd) = mailbox.post(Command::ConnectRadio) {
                    warn!("Backoff: mailbox full, {} dropped", cmd.name());
                }
            }
        }
    }
}
