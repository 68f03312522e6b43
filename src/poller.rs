//! Poller: registry of independently-scheduled background tasks.
//!
//! The eviction sweep and the orphaned-active-chunk sweep are both "run this
//! closure on its own interval until told to stop" -- rather than hand-roll a
//! `tokio::spawn` loop at each call site, `Poller::register` is the one place
//! that owns the interval timer, the stop check, and the begin/end events.

use std::future::Future;
use std::time::Duration;

use crate::events::{Event, EventBus};
use crate::provider::StopFlag;

pub struct Poller {
    stop: StopFlag,
    events: EventBus,
}

impl Poller {
    pub fn new(events: EventBus) -> Self {
        Self { stop: StopFlag::new(), events }
    }

    /// Register a task under `name`, run every `interval` until [`Self::stop`]
    /// is called. The first run happens after one interval, not immediately.
    pub fn register<F, Fut>(&self, name: impl Into<String>, interval: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let name = name.into();
        let stop = self.stop.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if stop.is_stopped() {
                    return;
                }
                events.publish(Event::PollingItemBegin { name: name.clone() });
                task().await;
                events.publish(Event::PollingItemEnd { name: name.clone() });
            }
        });
    }

    pub fn stop(&self) {
        self.stop.stop();
    }
}
