//! # Wire-friendly Pool Events
//!
//! None of these events hold references into live pool state; they are self-contained with
//! primitives so a host program (typically a GUI event loop) can poll them from any thread
//! without touching the pool itself.
//!
//! Delivery is broadcast, not work-stealing: every [EventConsumer] gets its own copy of every
//! event sent after it attached, so a progress view and a logger (or a test harness) can watch
//! the same pool without splitting the stream between them. Events sent while nobody is
//! attached are dropped.
//!
use crate::handler::WorkErrorKind;
use crate::protocol::SubmissionId;
use std::sync::{Arc, Mutex};

#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The "nothing happened" event.
    #[default]
    Noop,
    PoolStarting {
        requested: usize,
        count: usize,
    },
    PoolRunning {
        count: usize,
    },
    PoolStopping,
    PoolStopped,
    WorkerSpawned {
        worker_id: usize,
        pid: Option<u32>,
    },
    WorkerStarted {
        worker_id: usize,
    },
    WorkerLoaded {
        worker_id: usize,
    },
    WorkerExited {
        worker_id: usize,
        clean: bool,
    },
    WorkerCrashed {
        worker_id: usize,
    },
    SubmissionQueued {
        id: SubmissionId,
    },
    SubmissionDispatched {
        id: SubmissionId,
        worker_id: usize,
    },
    SubmissionCompleted {
        id: SubmissionId,
    },
    SubmissionFailed {
        id: SubmissionId,
        kind: WorkErrorKind,
    },
    SubmissionCancelled {
        id: SubmissionId,
    },
    NotificationBroadcast {
        name: String,
    },
    OffloadEnabled,
    OffloadDisabled,
}

/// One attached observer. Dropping it detaches it; the channel prunes it on the next send.
#[derive(Debug)]
pub struct EventConsumer {
    feed: crossbeam::channel::Receiver<Event>,
}

impl EventConsumer {
    pub fn pop(&self) -> Option<Event> {
        self.feed.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.feed.is_empty()
    }
}

impl Iterator for &EventConsumer {
    type Item = Event;

    fn next(&mut self) -> Option<Self::Item> {
        self.pop()
    }
}

#[derive(Clone, Debug, Default)]
pub struct EventChannel {
    taps: Arc<Mutex<Vec<crossbeam::channel::Sender<Event>>>>,
}

impl EventChannel {
    pub fn new() -> EventChannel {
        EventChannel::default()
    }

    /// Fans the event out to every attached consumer, pruning the ones that went away.
    pub fn send(&self, event: Event) {
        let mut taps = self
            .taps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        taps.retain(|tap| tap.send(event.clone()).is_ok());
    }

    /// Attaches a new consumer. It observes every event sent from this point on.
    pub fn consumer(&self) -> EventConsumer {
        let (tap, feed) = crossbeam::channel::unbounded();
        self.taps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tap);
        EventConsumer { feed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl quickcheck::Arbitrary for Event {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let worker_started = Self::WorkerStarted {
                worker_id: usize::arbitrary(g),
            };

            let worker_exited = Self::WorkerExited {
                worker_id: usize::arbitrary(g),
                clean: bool::arbitrary(g),
            };

            let submission_queued = Self::SubmissionQueued {
                id: SubmissionId::from(u64::arbitrary(g)),
            };

            let submission_dispatched = Self::SubmissionDispatched {
                id: SubmissionId::from(u64::arbitrary(g)),
                worker_id: usize::arbitrary(g),
            };

            let notification_broadcast = Self::NotificationBroadcast {
                name: String::arbitrary(g),
            };

            g.choose(&[
                Self::Noop,
                Self::PoolStopping,
                Self::PoolStopped,
                Self::OffloadEnabled,
                Self::OffloadDisabled,
                worker_started,
                worker_exited,
                submission_queued,
                submission_dispatched,
                notification_broadcast,
            ])
            .unwrap()
            .clone()
        }
    }

    #[test]
    fn a_fresh_consumer_has_nothing_to_pop() {
        let channel = EventChannel::new();
        let consumer = channel.consumer();
        assert!(consumer.is_empty());
        assert!(consumer.pop().is_none());
    }

    #[quickcheck]
    fn a_consumer_sees_events_in_send_order(events: Vec<Event>) {
        let channel = EventChannel::new();
        let consumer = channel.consumer();

        for event in &events {
            channel.send(event.clone());
        }

        let received: Vec<Event> = (&consumer).collect();
        assert_eq!(received, events);
        assert!(consumer.is_empty());
    }

    #[quickcheck]
    fn every_consumer_gets_its_own_copy(event: Event) {
        let channel = EventChannel::new();
        let progress_view = channel.consumer();
        let logger = channel.consumer();

        channel.send(event.clone());

        assert_eq!(progress_view.pop(), Some(event.clone()));
        assert_eq!(logger.pop(), Some(event));
    }

    #[test]
    fn consumers_only_see_events_sent_after_they_attach() {
        let channel = EventChannel::new();
        channel.send(Event::PoolStopping);

        let late = channel.consumer();
        channel.send(Event::PoolStopped);

        assert_eq!(late.pop(), Some(Event::PoolStopped));
        assert!(late.pop().is_none());
    }

    #[test]
    fn dropped_consumers_do_not_break_the_channel() {
        let channel = EventChannel::new();
        let short_lived = channel.consumer();
        let survivor = channel.consumer();
        drop(short_lived);

        channel.send(Event::OffloadDisabled);
        channel.send(Event::OffloadEnabled);

        assert_eq!(survivor.pop(), Some(Event::OffloadDisabled));
        assert_eq!(survivor.pop(), Some(Event::OffloadEnabled));
    }
}
