use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::{StreamError, StreamResult};

/// Topic→consumer bindings. Dropping a sender is what closes a consumer
/// channel, so removing it from the map closes it exactly once.
#[derive(Default)]
pub(crate) struct TopicRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    bindings: BTreeMap<String, mpsc::Sender<String>>,
    closed: bool,
}

impl TopicRegistry {
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bind(&self, topic: &str, capacity: usize) -> StreamResult<mpsc::Receiver<String>> {
        let mut state = self.state();
        if state.closed {
            return Err(StreamError::Closed);
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if state.bindings.insert(topic.to_string(), tx).is_some() {
            debug!(topic, "replaced existing stream consumer");
        }
        Ok(rx)
    }

    pub(crate) fn unbind(&self, topic: &str) -> bool {
        self.state().bindings.remove(topic).is_some()
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.state().bindings.keys().cloned().collect()
    }

    pub(crate) fn contains(&self, topic: &str) -> bool {
        self.state().bindings.contains_key(topic)
    }

    /// Hand a payload to the topic's consumer without ever blocking ingestion.
    pub(crate) fn deliver(&self, topic: &str, payload: String) {
        let mut state = self.state();
        let Some(sender) = state.bindings.get(topic) else {
            trace!(topic, "frame for unbound topic");
            return;
        };
        match sender.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(topic, "consumer channel full; dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(topic, "consumer went away; unbinding topic");
                state.bindings.remove(topic);
            }
        }
    }

    /// Close every consumer channel and refuse new bindings. Returns how many
    /// channels were closed by this call.
    pub(crate) fn close_all(&self) -> usize {
        let mut state = self.state();
        state.closed = true;
        let bindings = std::mem::take(&mut state.bindings);
        bindings.len()
    }
}
