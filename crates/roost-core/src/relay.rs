// ABOUTME: Fan-out of engine output to every observer of a session
// ABOUTME: Bounded per-subscriber queues; slow or vanished observers are dropped, never awaited

use crate::types::RelayEvent;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Default number of undelivered events a subscriber may hold.
pub const DEFAULT_RELAY_BUFFER: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<RelayEvent>,
}

#[derive(Default)]
struct SessionChannel {
    subscribers: Vec<Subscriber>,
    /// Response currently streaming and the text published for it so far
    in_flight: Option<(i64, String)>,
}

impl SessionChannel {
    fn track(&mut self, event: &RelayEvent) {
        match event {
            RelayEvent::ResponseStarted { seq, .. } => self.in_flight = Some((*seq, String::new())),
            RelayEvent::Token(token) if token.is_final => self.in_flight = None,
            RelayEvent::Token(token) => match &mut self.in_flight {
                Some((seq, partial)) if *seq == token.seq => partial.push_str(&token.delta),
                _ => self.in_flight = Some((token.seq, token.delta.clone())),
            },
            RelayEvent::Interrupted { .. } | RelayEvent::EngineCrashed { .. } => {
                self.in_flight = None
            }
            _ => {}
        }
    }

    fn catch_up_event(&self, session_id: &str) -> RelayEvent {
        match &self.in_flight {
            Some((seq, partial)) => RelayEvent::InFlight {
                session_id: session_id.to_string(),
                seq: *seq,
                partial: partial.clone(),
            },
            None => RelayEvent::CaughtUp {
                session_id: session_id.to_string(),
            },
        }
    }
}

/// Per-session publish/subscribe hub shared by every engine and observer in a process.
pub struct StreamRelay {
    buffer: usize,
    sessions: Mutex<HashMap<String, SessionChannel>>,
    next_id: AtomicU64,
}

impl Default for StreamRelay {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_BUFFER)
    }
}

impl StreamRelay {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionChannel>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an observer. The first event is always `CaughtUp` or an `InFlight` snapshot.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut sessions = self.sessions();
        let channel = sessions.entry(session_id.to_string()).or_default();
        let first = channel.catch_up_event(session_id);
        channel.subscribers.push(Subscriber { id, tx });

        tracing::debug!(session_id = %session_id, subscriber = id, "Subscriber registered");
        Subscription {
            id,
            session_id: session_id.to_string(),
            first: Some(first),
            rx,
        }
    }

    /// Deliver an event to every subscriber of its session, in call order.
    pub fn publish(&self, event: RelayEvent) {
        let session_id = event.session_id().to_string();
        let mut sessions = self.sessions();
        let channel = sessions.entry(session_id.clone()).or_default();
        channel.track(&event);

        channel
            .subscribers
            .retain(|sub| match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        session_id = %session_id,
                        subscriber = sub.id,
                        "Subscriber fell behind, dropping it"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(session_id = %session_id, subscriber = sub.id, "Subscriber disconnected");
                    false
                }
            });
        prune(&mut sessions, &session_id);
    }

    /// Remove a subscriber. Returns whether it was still registered.
    pub fn unsubscribe(&self, session_id: &str, subscriber_id: u64) -> bool {
        let mut sessions = self.sessions();
        let Some(channel) = sessions.get_mut(session_id) else {
            return false;
        };
        let before = channel.subscribers.len();
        channel.subscribers.retain(|sub| sub.id != subscriber_id);
        let removed = before != channel.subscribers.len();
        prune(&mut sessions, session_id);
        removed
    }

    /// Tell every observer the session closed and drop their registrations.
    pub fn close_session(&self, session_id: &str) {
        let channel = self.sessions().remove(session_id);
        if let Some(channel) = channel {
            for sub in channel.subscribers {
                let _ = sub.tx.try_send(RelayEvent::SessionClosed {
                    session_id: session_id.to_string(),
                });
            }
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions()
            .get(session_id)
            .map(|channel| channel.subscribers.len())
            .unwrap_or(0)
    }

    /// Sequence number of the response currently streaming through the relay
    pub fn in_flight(&self, session_id: &str) -> Option<i64> {
        self.sessions()
            .get(session_id)
            .and_then(|channel| channel.in_flight.as_ref().map(|(seq, _)| *seq))
    }
}

/// Forget a session nobody is watching and nothing is streaming on
fn prune(sessions: &mut HashMap<String, SessionChannel>, session_id: &str) {
    if sessions
        .get(session_id)
        .is_some_and(|channel| channel.subscribers.is_empty() && channel.in_flight.is_none())
    {
        sessions.remove(session_id);
    }
}

/// Receiving end of a relay registration. Dropping it unsubscribes on the next publish.
pub struct Subscription {
    id: u64,
    session_id: String,
    /// Catch-up event, held back until the first read
    first: Option<RelayEvent>,
    rx: mpsc::Receiver<RelayEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Account for a response the store holds in flight.
    ///
    /// The relay only knows about responses streaming in this process. If it
    /// had nothing to report, the catch-up event becomes an `InFlight`
    /// snapshot of the stored message instead of `CaughtUp`.
    pub fn merge_stored_in_flight(&mut self, seq: i64, partial: String) {
        if let Some(RelayEvent::CaughtUp { session_id }) = &self.first {
            self.first = Some(RelayEvent::InFlight {
                session_id: session_id.clone(),
                seq,
                partial,
            });
        }
    }

    /// Next event, or None once the relay dropped this subscriber
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        match self.first.take() {
            Some(event) => Some(event),
            None => self.rx.recv().await,
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        self.first.take().or_else(|| self.rx.try_recv().ok())
    }
}

impl Stream for Subscription {
    type Item = RelayEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.first.take() {
            return Poll::Ready(Some(event));
        }
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenEvent;
    use futures::StreamExt;

    fn token(seq: i64, delta: &str, is_final: bool) -> RelayEvent {
        RelayEvent::Token(TokenEvent {
            session_id: "s1".to_string(),
            seq,
            delta: delta.to_string(),
            is_final,
        })
    }

    fn deltas(events: &[RelayEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Token(t) => Some(t.delta.clone()),
                _ => None,
            })
            .collect()
    }

    fn drain(sub: &mut Subscription) -> Vec<RelayEvent> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    #[test]
    fn test_idle_session_subscriber_gets_caught_up() {
        let relay = StreamRelay::default();
        let mut sub = relay.subscribe("s1");
        assert_eq!(
            sub.try_recv(),
            Some(RelayEvent::CaughtUp {
                session_id: "s1".to_string()
            })
        );
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_mid_stream_joiner_sees_partial_as_in_flight() {
        let relay = StreamRelay::default();
        relay.publish(RelayEvent::ResponseStarted {
            session_id: "s1".to_string(),
            seq: 4,
        });
        relay.publish(token(4, "Hel", false));
        relay.publish(token(4, "lo", false));
        assert_eq!(relay.in_flight("s1"), Some(4));

        let mut late = relay.subscribe("s1");
        assert_eq!(
            late.try_recv(),
            Some(RelayEvent::InFlight {
                session_id: "s1".to_string(),
                seq: 4,
                partial: "Hello".to_string(),
            })
        );

        relay.publish(token(4, "", true));
        assert_eq!(relay.in_flight("s1"), None);
        let mut after = relay.subscribe("s1");
        assert!(matches!(after.try_recv(), Some(RelayEvent::CaughtUp { .. })));
    }

    #[test]
    fn test_every_subscriber_sees_publish_order() {
        let relay = StreamRelay::default();
        let mut a = relay.subscribe("s1");
        let mut b = relay.subscribe("s1");
        let mut other = relay.subscribe("s2");

        for i in 0..20 {
            relay.publish(token(1, &i.to_string(), false));
        }

        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(deltas(&drain(&mut a)), expected);
        assert_eq!(deltas(&drain(&mut b)), expected);
        // Other sessions are untouched
        assert_eq!(drain(&mut other).len(), 1);
    }

    #[test]
    fn test_slow_subscriber_dropped_without_affecting_others() {
        let relay = StreamRelay::new(4);
        let mut fast = relay.subscribe("s1");
        let mut slow = relay.subscribe("s1");
        assert_eq!(relay.subscriber_count("s1"), 2);

        let mut fast_seen = drain(&mut fast);
        for i in 0..10 {
            relay.publish(token(1, &i.to_string(), false));
            fast_seen.extend(drain(&mut fast));
        }

        assert_eq!(
            deltas(&fast_seen),
            (0..10).map(|i| i.to_string()).collect::<Vec<_>>()
        );
        assert_eq!(relay.subscriber_count("s1"), 1);

        // The slow one kept a gap-free prefix, then its stream ended
        let slow_seen = drain(&mut slow);
        assert!(matches!(slow_seen[0], RelayEvent::CaughtUp { .. }));
        assert_eq!(deltas(&slow_seen), vec!["0", "1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let relay = StreamRelay::default();
        let sub = relay.subscribe("s1");
        let mut keep = relay.subscribe("s1");
        drop(sub);

        relay.publish(token(1, "x", false));
        assert_eq!(relay.subscriber_count("s1"), 1);
        assert!(matches!(keep.next().await, Some(RelayEvent::CaughtUp { .. })));
        assert!(matches!(keep.next().await, Some(RelayEvent::Token(_))));
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let relay = StreamRelay::default();
        let sub = relay.subscribe("s1");
        assert!(relay.unsubscribe("s1", sub.id()));
        assert!(!relay.unsubscribe("s1", sub.id()));
        assert!(!relay.unsubscribe("unknown", 99));
        assert_eq!(relay.subscriber_count("s1"), 0);
    }

    #[tokio::test]
    async fn test_close_session_ends_streams() {
        let relay = StreamRelay::default();
        let mut sub = relay.subscribe("s1");
        relay.close_session("s1");

        assert!(matches!(sub.recv().await, Some(RelayEvent::CaughtUp { .. })));
        assert!(matches!(
            sub.recv().await,
            Some(RelayEvent::SessionClosed { .. })
        ));
        assert_eq!(sub.recv().await, None);
        relay.close_session("s1");
    }

    #[test]
    fn test_crash_clears_in_flight() {
        let relay = StreamRelay::default();
        relay.publish(token(2, "par", false));
        relay.publish(RelayEvent::EngineCrashed {
            session_id: "s1".to_string(),
            seq: Some(2),
            detail: "exit status 9".to_string(),
        });
        assert_eq!(relay.in_flight("s1"), None);
    }

    #[test]
    fn test_stored_in_flight_replaces_caught_up() {
        let relay = StreamRelay::default();
        let mut sub = relay.subscribe("s1");
        sub.merge_stored_in_flight(7, "so far".to_string());
        assert_eq!(
            sub.try_recv(),
            Some(RelayEvent::InFlight {
                session_id: "s1".to_string(),
                seq: 7,
                partial: "so far".to_string(),
            })
        );

        // A local snapshot already carries the streamed text and wins
        relay.publish(token(3, "local", false));
        let mut local = relay.subscribe("s1");
        local.merge_stored_in_flight(3, String::new());
        assert!(matches!(
            local.try_recv(),
            Some(RelayEvent::InFlight { seq: 3, partial, .. }) if partial == "local"
        ));
    }

    #[test]
    fn test_catch_up_does_not_use_queue_capacity() {
        let relay = StreamRelay::new(1);
        let mut sub = relay.subscribe("s1");
        relay.publish(token(1, "a", false));
        assert_eq!(relay.subscriber_count("s1"), 1);
        assert!(matches!(sub.try_recv(), Some(RelayEvent::CaughtUp { .. })));
        assert!(matches!(sub.try_recv(), Some(RelayEvent::Token(_))));
    }

    #[test]
    fn test_unwatched_sessions_are_forgotten() {
        let relay = StreamRelay::default();
        relay.publish(RelayEvent::ResponseStarted {
            session_id: "s1".to_string(),
            seq: 1,
        });
        relay.publish(token(1, "x", false));
        // Still streaming, so the snapshot is kept for late joiners
        assert_eq!(relay.sessions().len(), 1);

        relay.publish(token(1, "", true));
        relay.publish(RelayEvent::UserMessage {
            session_id: "s2".to_string(),
            seq: 1,
            body: "hi".to_string(),
        });
        assert!(relay.sessions().is_empty());

        let sub = relay.subscribe("s3");
        assert!(relay.unsubscribe("s3", sub.id()));
        assert!(relay.sessions().is_empty());
    }
}
