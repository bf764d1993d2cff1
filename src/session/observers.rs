//! Observer registry: one optional slot per event kind.
//!
//! Registering again replaces the previous registrant. Callbacks are
//! cloned out of the lock before they run, so a callback may itself
//! register or post commands without deadlocking.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use heapless::LinearMap;
use log::debug;

use super::SessionState;
use super::command::InboundMessage;
use crate::error::{Result, SessionError};

/// Radio ports that may have a receive handler at once.
pub const RADIO_HANDLER_SLOTS: usize = 8;

pub type ReceiveHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;
pub type StateChangedCallback = Arc<dyn Fn(SessionState) + Send + Sync>;
pub type ConnectResultCallback = Arc<dyn Fn(Result<()>) + Send + Sync>;

/// Where decrypted application data is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceivePort {
    /// Maintenance traffic over the serial link.
    Serial,
    /// Radio traffic for one destination port.
    Radio(u16),
}

#[derive(Default)]
struct Slots {
    serial: Option<ReceiveHandler>,
    radio: LinearMap<u16, ReceiveHandler, RADIO_HANDLER_SLOTS>,
    state_changed: Option<StateChangedCallback>,
    connect_result: Option<ConnectResultCallback>,
}

pub struct Observers {
    slots: Mutex<Slots>,
}

impl Default for Observers {
    fn default() -> Self {
        Self::new()
    }
}

impl Observers {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn set_receive_handler(&self, port: ReceivePort, handler: ReceiveHandler) -> Result<()> {
        let mut slots = self.lock();
        match port {
            ReceivePort::Serial => slots.serial = Some(handler),
            ReceivePort::Radio(p) => {
                slots
                    .radio
                    .insert(p, handler)
                    .map_err(|_| SessionError::BufferExhausted)?;
            }
        }
        debug!("session: receive handler registered for {port:?}");
        Ok(())
    }

    pub fn set_state_changed(&self, cb: StateChangedCallback) {
        self.lock().state_changed = Some(cb);
    }

    pub fn set_connect_result(&self, cb: ConnectResultCallback) {
        self.lock().connect_result = Some(cb);
    }

    pub fn receive_handler(&self, port: ReceivePort) -> Option<ReceiveHandler> {
        let slots = self.lock();
        match port {
            ReceivePort::Serial => slots.serial.clone(),
            ReceivePort::Radio(p) => slots.radio.get(&p).cloned(),
        }
    }

    pub fn notify_state_changed(&self, state: SessionState) {
        let cb = self.lock().state_changed.clone();
        if let Some(cb) = cb {
            cb(state);
        }
    }

    pub fn notify_connect_result(&self, result: Result<()>) {
        let cb = self.lock().connect_result.clone();
        if let Some(cb) = cb {
            cb(result);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
