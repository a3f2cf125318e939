use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::sync::scheduler::JobRunningEvent;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    callback: Callback<T>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

/// In-process pub/sub keyed by job-set id.
///
/// Each job set maps to an immutable subscriber list that is replaced on
/// every subscribe/unsubscribe, so `publish` iterates a snapshot without
/// holding any map lock while callbacks run.
pub struct EventBus<T = JobRunningEvent> {
    subscribers: DashMap<String, Arc<Vec<Subscriber<T>>>>,
    next_id: AtomicU64,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` for events on `job_set_id`.
    ///
    /// The returned guard removes the subscription when dropped.
    pub fn subscribe<F>(self: &Arc<Self>, job_set_id: &str, callback: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            id,
            callback: Arc::new(callback),
        };

        match self.subscribers.entry(job_set_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let mut next = entry.get().as_ref().clone();
                next.push(subscriber);
                entry.insert(Arc::new(next));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(vec![subscriber]));
            }
        }

        tracing::trace!(job_set_id, subscription = id, "Subscribed");
        Subscription {
            bus: Arc::clone(self),
            job_set_id: job_set_id.to_string(),
            id,
        }
    }

    fn unsubscribe(&self, job_set_id: &str, id: u64) {
        if let Entry::Occupied(mut entry) = self.subscribers.entry(job_set_id.to_string()) {
            let remaining: Vec<_> = entry
                .get()
                .iter()
                .filter(|s| s.id != id)
                .cloned()
                .collect();
            if remaining.is_empty() {
                entry.remove();
            } else {
                entry.insert(Arc::new(remaining));
            }
        }
        tracing::trace!(job_set_id, subscription = id, "Unsubscribed");
    }

    /// Deliver `event` to every subscriber of `job_set_id`. Returns how many
    /// subscribers saw it.
    pub fn publish(&self, job_set_id: &str, event: &T) -> usize {
        let snapshot = match self.subscribers.get(job_set_id) {
            Some(list) => Arc::clone(list.value()),
            None => return 0,
        };

        for subscriber in snapshot.iter() {
            (subscriber.callback)(event);
        }
        snapshot.len()
    }

    pub fn subscriber_count(&self, job_set_id: &str) -> usize {
        self.subscribers
            .get(job_set_id)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

/// Live subscription on an [`EventBus`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription<T> {
    bus: Arc<EventBus<T>>,
    job_set_id: String,
    id: u64,
}

impl<T> Subscription<T> {
    pub fn job_set_id(&self) -> &str {
        &self.job_set_id
    }

    /// Unsubscribe now.
    pub fn cancel(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.job_set_id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn publish_fans_out_to_matching_job_set_only() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = Arc::clone(&seen);
        let _sub_a = bus.subscribe("set-a", move |v| a.lock().unwrap().push(("a", *v)));
        let b = Arc::clone(&seen);
        let _sub_b = bus.subscribe("set-a", move |v| b.lock().unwrap().push(("b", *v)));
        let c = Arc::clone(&seen);
        let _sub_c = bus.subscribe("set-c", move |v| c.lock().unwrap().push(("c", *v)));

        assert_eq!(bus.publish("set-a", &7), 2);
        assert_eq!(bus.publish("set-missing", &8), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let first = bus.subscribe("s", |_| {});
        let second = bus.subscribe("s", |_| {});
        assert_eq!(bus.subscriber_count("s"), 2);

        drop(first);
        assert_eq!(bus.subscriber_count("s"), 1);

        second.cancel();
        assert_eq!(bus.subscriber_count("s"), 0);
        assert_eq!(bus.publish("s", &1), 0);
    }

    #[test]
    fn callback_may_subscribe_while_publishing() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let inner_bus = Arc::clone(&bus);
        let nested = Arc::new(Mutex::new(Vec::new()));
        let nested_clone = Arc::clone(&nested);

        let _sub = bus.subscribe("s", move |_| {
            let sub = inner_bus.subscribe("s", |_| {});
            nested_clone.lock().unwrap().push(sub);
        });

        assert_eq!(bus.publish("s", &1), 1);
        assert_eq!(bus.subscriber_count("s"), 2);
        nested.lock().unwrap().clear();
        assert_eq!(bus.subscriber_count("s"), 1);
    }
}
