use dchat_core::{ChatTransport, Error, Pending, TransportRequest};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::output::{Event, Output};

/// Transport that acknowledges every request immediately and prints it.
///
/// Peers and groups marked unreachable get their requests failed instead.
pub struct LoopbackTransport {
    output: Output,
    next_id: AtomicU64,
    unreachable: Mutex<HashSet<String>>,
}

impl LoopbackTransport {
    pub fn new(output: Output) -> Self {
        Self {
            output,
            next_id: AtomicU64::new(1),
            unreachable: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_unreachable(&self, id: &str, unreachable: bool) {
        let mut set = self
            .unreachable
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if unreachable {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    fn is_unreachable(&self, request: &TransportRequest) -> bool {
        let set = self
            .unreachable
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        request.subject_id().is_some_and(|id| set.contains(id))
    }
}

impl ChatTransport for LoopbackTransport {
    fn request(&self, request: TransportRequest) -> Pending {
        let id = format!("loop-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let failed = self.is_unreachable(&request);
        self.output.event(Event::TransportRequest {
            id: &id,
            name: request.name(),
            subject_id: request.subject_id(),
            acknowledged: !failed,
        });
        let result = if failed {
            Err(Error::Transport(format!(
                "{} unreachable",
                request.subject_id().unwrap_or_default()
            )))
        } else {
            Ok(())
        };
        Pending::ready(id, result)
    }
}
