//! Advisory completion signals
//!
//! Workers publish `{job_id, num_sources}` after each block. Delivery is
//! at-least-once and unordered and nothing depends on it for correctness:
//! the store remains the authority on progress.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{info, warn};

use super::JobId;

pub const EXCHANGE_NAME: &str = "oq.htasks";

pub fn routing_key(job_id: JobId) -> String {
    format!("htasks.job.{job_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub job_id: JobId,
    pub num_sources: u64,
}

/// In-process direct exchange: a message goes to every mailbox bound to its
/// exact routing key.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    bindings: Arc<RwLock<HashMap<String, Vec<UnboundedSender<Vec<u8>>>>>>,
}

impl Exchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &'static str {
        EXCHANGE_NAME
    }

    pub fn bind(&self, key: &str) -> Mailbox {
        let (sender, receiver) = unbounded_channel();
        match self.bindings.write() {
            Ok(mut bindings) => bindings.entry(key.to_string()).or_default().push(sender),
            Err(_) => {
                warn!(key, "binding table poisoned; mailbox stays empty");
            }
        }
        Mailbox {
            key: key.to_string(),
            receiver,
        }
    }

    pub fn unbind(&self, key: &str) {
        if let Ok(mut bindings) = self.bindings.write() {
            bindings.remove(key);
        }
    }

    /// Fire and forget. Returns how many mailboxes received the message.
    pub fn publish(&self, signal: &CompletionSignal) -> usize {
        let key = routing_key(signal.job_id);
        let body = match serde_json::to_vec(signal) {
            Ok(body) => body,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to encode completion signal");
                return 0;
            }
        };

        let Ok(mut bindings) = self.bindings.write() else {
            warn!(key = %key, "binding table poisoned; completion signal dropped");
            return 0;
        };
        let Some(senders) = bindings.get_mut(&key) else {
            return 0;
        };

        senders.retain(|sender| !sender.is_closed());
        senders
            .iter()
            .filter(|sender| sender.send(body.clone()).is_ok())
            .count()
    }
}

#[derive(Debug)]
pub struct Mailbox {
    key: String,
    receiver: UnboundedReceiver<Vec<u8>>,
}

impl Mailbox {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next decodable signal without waiting. Malformed bodies are skipped.
    pub fn try_recv(&mut self) -> Option<CompletionSignal> {
        loop {
            match self.receiver.try_recv() {
                Ok(body) => {
                    if let Some(signal) = self.decode(&body) {
                        return Some(signal);
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return None,
            }
        }
    }

    /// Waits for the next signal; `None` once every publisher is gone.
    /// Must not be called from inside an async runtime.
    pub fn blocking_recv(&mut self) -> Option<CompletionSignal> {
        while let Some(body) = self.receiver.blocking_recv() {
            if let Some(signal) = self.decode(&body) {
                return Some(signal);
            }
        }
        None
    }

    pub fn drain(&mut self) -> Vec<CompletionSignal> {
        let mut out = Vec::new();
        while let Some(signal) = self.try_recv() {
            out.push(signal);
        }
        out
    }

    fn decode(&self, body: &[u8]) -> Option<CompletionSignal> {
        match serde_json::from_slice(body) {
            Ok(signal) => Some(signal),
            Err(err) => {
                warn!(key = %self.key, error = %err, "ignoring malformed completion signal");
                None
            }
        }
    }
}

/// Coordinator side: running totals of the advisory counts per job.
#[derive(Debug)]
pub struct SignalMonitor {
    started: Instant,
    totals: BTreeMap<JobId, u64>,
}

impl Default for SignalMonitor {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            totals: BTreeMap::new(),
        }
    }
}

impl SignalMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, signal: CompletionSignal) {
        *self.totals.entry(signal.job_id).or_default() += signal.num_sources;
    }

    /// Folds every pending signal of the mailbox into the totals.
    pub fn consume(&mut self, mailbox: &mut Mailbox) -> usize {
        let signals = mailbox.drain();
        let count = signals.len();
        for signal in signals {
            self.observe(signal);
        }
        count
    }

    pub fn total(&self, job_id: JobId) -> u64 {
        self.totals.get(&job_id).copied().unwrap_or(0)
    }

    pub fn log_throughput(&self, job_id: JobId) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let total = self.total(job_id);
        let rate = if elapsed > 0.0 {
            total as f64 / elapsed
        } else {
            0.0
        };
        info!(
            job_id,
            sources = total,
            elapsed_secs = elapsed,
            sources_per_sec = rate,
            "completion signals"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_follows_job_id() {
        assert_eq!(routing_key(7), "htasks.job.7");
        assert_eq!(Exchange::new().name(), "oq.htasks");
    }

    #[test]
    fn messages_reach_only_the_bound_job() {
        let exchange = Exchange::new();
        let mut job_1 = exchange.bind(&routing_key(1));
        let mut job_2 = exchange.bind(&routing_key(2));

        let delivered = exchange.publish(&CompletionSignal {
            job_id: 1,
            num_sources: 3,
        });
        assert_eq!(delivered, 1);
        assert_eq!(
            job_1.drain(),
            vec![CompletionSignal {
                job_id: 1,
                num_sources: 3
            }]
        );
        assert!(job_2.drain().is_empty());
    }

    #[test]
    fn publishing_without_a_binding_is_not_an_error() {
        let exchange = Exchange::new();
        assert_eq!(
            exchange.publish(&CompletionSignal {
                job_id: 9,
                num_sources: 1
            }),
            0
        );

        let mailbox = exchange.bind(&routing_key(9));
        drop(mailbox);
        assert_eq!(
            exchange.publish(&CompletionSignal {
                job_id: 9,
                num_sources: 1
            }),
            0
        );
    }

    #[test]
    fn wire_format_is_job_id_and_num_sources() {
        let body = serde_json::to_value(CompletionSignal {
            job_id: 4,
            num_sources: 10,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"job_id": 4, "num_sources": 10}));
    }

    #[test]
    fn monitor_accumulates_duplicates_and_reordering() {
        let exchange = Exchange::new();
        let mut mailbox = exchange.bind(&routing_key(5));
        for num_sources in [2, 1, 2] {
            exchange.publish(&CompletionSignal {
                job_id: 5,
                num_sources,
            });
        }

        let mut monitor = SignalMonitor::new();
        assert_eq!(monitor.consume(&mut mailbox), 3);
        assert_eq!(monitor.total(5), 5);
        assert_eq!(monitor.total(6), 0);
    }
}
