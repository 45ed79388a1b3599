//! Domain events and the observer contract presentation layers subscribe to.

use crate::fleet::{BusStatus, RouteName};
use crate::replacement::ReplacementOutcome;
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const MAX_EVENT_HISTORY: usize = 64;
const MAX_OUTBOX: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum FleetEvent {
    StatusChanged {
        bus_id: String,
        from: BusStatus,
        to: BusStatus,
        at_ms: u64,
    },
    BatteryLevelChanged {
        bus_id: String,
        level: f64,
        at_ms: u64,
    },
    LowBatteryCrossed {
        bus_id: String,
        level: f64,
        route: RouteName,
        at_ms: u64,
    },
    /// A crossing that arrived while another negotiation was open.
    LowBatteryDropped {
        bus_id: String,
        open_for: String,
        at_ms: u64,
    },
    NegotiationOpened {
        negotiation_id: u32,
        bus_id: String,
        candidates: Vec<String>,
        can_postpone: bool,
        at_ms: u64,
    },
    ReplacementDecided {
        negotiation_id: u32,
        bus_id: String,
        outcome: ReplacementOutcome,
        at_ms: u64,
    },
    BusSkipped {
        bus_id: String,
        reason: String,
        at_ms: u64,
    },
    TickCompleted {
        tick: u64,
        clock_ms: u64,
    },
}

impl FleetEvent {
    /// Events worth keeping in the short history. Per-tick battery updates
    /// would flush everything else out.
    fn is_notable(&self) -> bool {
        !matches!(
            self,
            FleetEvent::BatteryLevelChanged { .. } | FleetEvent::TickCompleted { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u32,
    pub event: FleetEvent,
}

pub trait FleetObserver: Send {
    fn on_event(&mut self, event: &FleetEvent);
}

impl<F> FleetObserver for F
where
    F: FnMut(&FleetEvent) + Send,
{
    fn on_event(&mut self, event: &FleetEvent) {
        self(event)
    }
}

/// Fans events out to observers synchronously, keeps a bounded history of
/// notable events, and buffers everything for hosts that drain in batches.
pub struct EventBus {
    observers: Vec<Box<dyn FleetObserver>>,
    history: BoundedVec<EventRecord, MAX_EVENT_HISTORY>,
    outbox: VecDeque<FleetEvent>,
    next_event_id: u32,
    dropped_from_outbox: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
            history: BoundedVec::new(),
            outbox: VecDeque::new(),
            next_event_id: 1,
            dropped_from_outbox: 0,
        }
    }

    pub fn subscribe(&mut self, observer: impl FleetObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn emit(&mut self, event: FleetEvent) {
        for observer in &mut self.observers {
            observer.on_event(&event);
        }

        if event.is_notable() {
            let record = EventRecord {
                id: self.next_event_id,
                event: event.clone(),
            };
            self.next_event_id = self.next_event_id.wrapping_add(1);

            if self.history.is_full() {
                self.history.remove(0);
            }
            let _ = self.history.push(record);
        }

        if self.outbox.len() >= MAX_OUTBOX {
            self.outbox.pop_front();
            self.dropped_from_outbox += 1;
        }
        self.outbox.push_back(event);
    }

    /// Takes every event emitted since the last drain.
    pub fn drain(&mut self) -> Vec<FleetEvent> {
        self.outbox.drain(..).collect()
    }

    pub fn history(&self) -> &[EventRecord] {
        &self.history
    }

    pub fn dropped_from_outbox(&self) -> u64 {
        self.dropped_from_outbox
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observers.len())
            .field("history", &self.history.len())
            .field("outbox", &self.outbox.len())
            .finish()
    }
}
