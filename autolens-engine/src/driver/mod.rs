//! CAN driver abstraction
//!
//! A driver is shared as `Arc<dyn CanDriver>`: every method takes `&self`
//! and implementations guard their state internally. Frames, errors and
//! lifecycle changes are published as [`DriverEvent`]s through an
//! [`EventHub`]; subscribers get their own bounded queue and the driver never
//! blocks on a slow consumer.
//!
//! Two implementations exist:
//! - [`VectorDriver`]: runtime-loaded Vector XL library
//! - [`SimulatedDriver`]: synthetic traffic, optionally shaped by a DBC

pub mod simulator;
pub mod vector;
pub mod xl;

pub use simulator::{SimulatedDriver, SimulationProfile};
pub use vector::VectorDriver;

use crate::config::BusConfig;
use crate::signals::SignalDatabase;
use crate::types::{CanFrame, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Capacity of each subscriber queue
pub const EVENT_QUEUE_CAPACITY: usize = 65_536;

/// Notifications published by a driver
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// A frame arrived (or a transmitted frame was echoed)
    FrameReceived(CanFrame),
    /// A driver error; fatal hardware errors are published once
    Error(String),
    /// The channel was opened
    ChannelOpened,
    /// The channel was closed
    ChannelClosed,
}

/// Description of an adapter channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel name reported by the adapter, e.g. "VN1630 Channel 1"
    pub name: String,
    /// Hardware product name
    pub hw_type_name: String,
    pub hw_type: u8,
    pub hw_index: u8,
    pub hw_channel: u8,
    pub channel_index: u8,
    /// Access mask used to open the channel
    pub channel_mask: u64,
    /// Serial number, 0 if unknown
    pub serial: u32,
    pub supports_fd: bool,
    pub is_on_bus: bool,
    pub transceiver_name: String,
}

impl ChannelInfo {
    /// Display string for channel pickers
    ///
    /// # Example
    /// ```
    /// use autolens_engine::driver::ChannelInfo;
    ///
    /// let info = ChannelInfo { name: "VN1630 Channel 1".into(), serial: 12345, ..Default::default() };
    /// assert_eq!(info.display_string(), "VN1630 Channel 1  [S/N: 12345]");
    /// ```
    pub fn display_string(&self) -> String {
        if self.serial > 0 {
            format!("{}  [S/N: {}]", self.name, self.serial)
        } else {
            self.name.clone()
        }
    }
}

/// Hardware adapter interface
pub trait CanDriver: Send + Sync {
    /// Short driver name shown to the user
    fn driver_name(&self) -> String;

    /// True if the driver can be used on this machine
    fn is_available(&self) -> bool;

    /// Acquire driver-global resources
    fn initialize(&self) -> Result<()>;

    /// Close any open channel and release driver-global resources
    fn shutdown(&self);

    /// Enumerate CAN-capable channels
    fn detect_channels(&self) -> Vec<ChannelInfo>;

    /// Open a channel and start producing frames
    fn open_channel(&self, info: &ChannelInfo, config: &BusConfig) -> Result<()>;

    /// Stop producing frames and release the channel
    fn close_channel(&self);

    /// True while a channel is open
    fn is_open(&self) -> bool;

    /// Send one frame
    fn transmit(&self, frame: &CanFrame) -> Result<()>;

    /// Blocking receive with a bound
    ///
    /// `Ok(None)` means nothing arrived within `timeout`.
    fn receive(&self, timeout: Duration) -> Result<Option<CanFrame>>;

    /// Drop everything queued in the adapter
    fn flush_receive_queue(&self) -> Result<()>;

    /// Most recent error message
    fn last_error(&self) -> String;

    /// Register a new event subscriber
    fn subscribe(&self) -> Receiver<DriverEvent>;

    /// Drive work that runs on the caller's thread
    ///
    /// Called from the engine dispatcher on every poll. Drivers with their
    /// own receive thread ignore it.
    fn service(&self, _now: Instant) {}

    /// Shape generated traffic after a database; no-op for real hardware
    fn set_simulation_database(&self, _db: &SignalDatabase) {}

    /// True for drivers that do not talk to hardware
    fn is_simulated(&self) -> bool {
        false
    }
}

/// Fan-out of driver events to subscribers
///
/// Each subscriber owns a bounded queue. Publishing never blocks: a full
/// queue drops the event and bumps a counter, a disconnected subscriber is
/// removed.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<DriverEvent>>>,
    dropped: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber
    pub fn subscribe(&self) -> Receiver<DriverEvent> {
        let (tx, rx) = bounded(EVENT_QUEUE_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish to every live subscriber
    pub fn publish(&self, event: DriverEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    log::warn!("Driver event queue full, {} events dropped so far", dropped);
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Events dropped because a subscriber queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Status strings that mean the adapter is gone
pub fn is_fatal_hardware_error(message: &str) -> bool {
    ["HW_NOT_PRESENT", "HW_NOT_READY", "CANNOT_OPEN_DRIVER"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_fan_out_and_prune() {
        let hub = EventHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();
        hub.publish(DriverEvent::ChannelOpened);
        assert_eq!(a.try_recv().ok(), Some(DriverEvent::ChannelOpened));
        assert_eq!(b.try_recv().ok(), Some(DriverEvent::ChannelOpened));

        drop(b);
        hub.publish(DriverEvent::ChannelClosed);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(a.try_recv().ok(), Some(DriverEvent::ChannelClosed));
    }

    #[test]
    fn test_fatal_error_detection() {
        assert!(is_fatal_hardware_error("xlReceive: HW_NOT_PRESENT"));
        assert!(is_fatal_hardware_error("xlOpenPort: CANNOT_OPEN_DRIVER"));
        assert!(!is_fatal_hardware_error("xlReceive: QUEUE_EMPTY"));
    }

    #[test]
    fn test_display_string_without_serial() {
        let info = ChannelInfo {
            name: "Demo Channel 1".into(),
            ..Default::default()
        };
        assert_eq!(info.display_string(), "Demo Channel 1");
    }
}
