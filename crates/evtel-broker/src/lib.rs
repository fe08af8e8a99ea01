//! evtel-broker - Publish/coalesce data broker
//!
//! Decouples vehicle data collection from its observers. Decoders publish
//! item/value pairs as responses decode; observers register one callback
//! per capability bit and drain at their own cadence. Values written
//! between drains coalesce - an observer sees the newest value, or the
//! average of the newest two when fast averaging is enabled.

use evtel_core::DataItems;
use parking_lot::Mutex;

/// Size of the broker table; one slot per possible capability bit.
pub const MAX_ITEMS: usize = 32;

type ValueHandler = Box<dyn Fn(f32) + Send>;

struct BrokerTable {
    fast_average: bool,
    handlers: [Option<ValueHandler>; MAX_ITEMS],
    latest: [f32; MAX_ITEMS],
    previous: [f32; MAX_ITEMS],
    updated: u32,
}

/// Subscriber table mapping capability bits to value callbacks.
///
/// Writers may be any producer; the mutex makes the (latest, previous)
/// pair atomic with respect to [`DataBroker::drain`]. Subscribers must not
/// call back into the broker from within their callback.
pub struct DataBroker {
    inner: Mutex<BrokerTable>,
}

impl Default for DataBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl DataBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BrokerTable {
                fast_average: false,
                handlers: std::array::from_fn(|_| None),
                latest: [0.0; MAX_ITEMS],
                previous: [0.0; MAX_ITEMS],
                updated: 0,
            }),
        }
    }

    /// When enabled, subscribers observe `(latest + previous) / 2` instead
    /// of the latest sample.
    pub fn enable_fast_average(&self, enable: bool) {
        self.inner.lock().fast_average = enable;
    }

    /// Install a subscriber for the lowest set bit of `items`, replacing
    /// any previous subscriber and clearing that entry's state.
    pub fn register_callback<F>(&self, items: DataItems, handler: F)
    where
        F: Fn(f32) + Send + 'static,
    {
        let Some(n) = items.lowest_index() else {
            return;
        };
        let mut table = self.inner.lock();
        table.handlers[n] = Some(Box::new(handler));
        table.updated &= !(1 << n);
        table.latest[n] = 0.0;
    }

    /// Publish a new value for the lowest set bit of `items`, preserving
    /// the previous value and marking the entry updated.
    pub fn set_value(&self, items: DataItems, value: f32) {
        let Some(n) = items.lowest_index() else {
            return;
        };
        let mut table = self.inner.lock();
        table.updated |= 1 << n;
        table.previous[n] = table.latest[n];
        table.latest[n] = value;
    }

    /// Deliver every updated entry to its subscriber, then clear the
    /// updated flags in bulk. Called from the observer loop.
    pub fn drain(&self) {
        let mut table = self.inner.lock();
        for n in 0..MAX_ITEMS {
            if table.updated & (1 << n) == 0 {
                continue;
            }
            if let Some(handler) = &table.handlers[n] {
                let value = if table.fast_average {
                    (table.latest[n] + table.previous[n]) / 2.0
                } else {
                    table.latest[n]
                };
                handler(value);
            }
        }
        table.updated = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn recorded(broker: &DataBroker, items: DataItems) -> Arc<Mutex<Vec<f32>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        broker.register_callback(items, move |v| sink.lock().push(v));
        seen
    }

    #[test]
    fn drain_delivers_latest_value_once() {
        let broker = DataBroker::new();
        let seen = recorded(&broker, DataItems::HV_BATT_V);

        broker.set_value(DataItems::HV_BATT_V, 360.0);
        broker.drain();
        broker.drain();

        assert_eq!(*seen.lock(), vec![360.0]);
    }

    #[test]
    fn fast_average_delivers_midpoint_of_last_two_samples() {
        let broker = DataBroker::new();
        let seen = recorded(&broker, DataItems::HV_BATT_V);

        broker.enable_fast_average(true);
        broker.set_value(DataItems::HV_BATT_V, 360.0);
        broker.set_value(DataItems::HV_BATT_V, 362.0);
        broker.drain();

        assert_eq!(*seen.lock(), vec![361.0]);
    }

    #[test]
    fn only_the_updated_subscriber_is_invoked() {
        let broker = DataBroker::new();
        let volts = recorded(&broker, DataItems::HV_BATT_V);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        broker.register_callback(DataItems::SPEED, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        broker.set_value(DataItems::HV_BATT_V, 402.5);
        broker.drain();

        assert_eq!(*volts.lock(), vec![402.5]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn register_clears_stale_update() {
        let broker = DataBroker::new();
        broker.set_value(DataItems::SPEED, 88.0);
        let seen = recorded(&broker, DataItems::SPEED);

        broker.drain();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn set_value_targets_lowest_bit_of_mask() {
        let broker = DataBroker::new();
        let current = recorded(&broker, DataItems::HV_BATT_I);

        broker.set_value(DataItems::HV_BATT_I | DataItems::SPEED, -12.5);
        broker.drain();

        assert_eq!(*current.lock(), vec![-12.5]);
    }
}
