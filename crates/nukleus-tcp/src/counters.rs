//! Per-route and process-wide monotonic counters, backed by a fixed-slot
//! shared-memory array so an external process can attach read-only and
//! observe live values without an IPC round-trip.

use std::{collections::HashMap, path::Path};

use nukleus_communication::{QueueError, SeqlockArray};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    FramesRead,
    FramesWrote,
    BytesRead,
    BytesWrote,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct CounterSlot {
    value: u64,
}

const GLOBAL_SLOTS: usize = 3;
const OVERFLOWS_SLOT: usize = 0;
const CONNECTIONS_OPENED_SLOT: usize = 1;
const CONNECTIONS_CLOSED_SLOT: usize = 2;

pub struct TcpCounters {
    array: SeqlockArray<CounterSlot>,
    index: HashMap<(u64, CounterKind), usize>,
    next_slot: usize,
}

impl TcpCounters {
    pub fn new_in_memory(capacity: usize) -> Self {
        Self { array: SeqlockArray::new(capacity.max(GLOBAL_SLOTS)), index: HashMap::new(), next_slot: GLOBAL_SLOTS }
    }

    pub fn create_or_open_shared<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, QueueError> {
        let array = SeqlockArray::create_or_open_shared(path, capacity.max(GLOBAL_SLOTS))?;
        Ok(Self { array, index: HashMap::new(), next_slot: GLOBAL_SLOTS })
    }

    fn slot_for(&mut self, route_id: u64, kind: CounterKind) -> usize {
        if let Some(&slot) = self.index.get(&(route_id, kind)) {
            return slot;
        }
        let slot = self.next_slot;
        nukleus_utils::safe_assert!(
            slot < self.array.len(),
            "counters file exhausted: {} slots allocated, capacity {}",
            slot,
            self.array.len()
        );
        self.index.insert((route_id, kind), slot);
        self.next_slot += 1;
        slot
    }

    fn add(&mut self, slot: usize, delta: u64) {
        let current = self.array.read_copy(slot).map(|(v, _)| v.value).unwrap_or_default();
        self.array.write(slot, &CounterSlot { value: current + delta });
    }

    fn get(&self, slot: usize) -> u64 {
        self.array.read_copy(slot).map(|(v, _)| v.value).unwrap_or_default()
    }

    pub fn incr(&mut self, route_id: u64, kind: CounterKind, delta: u64) {
        let slot = self.slot_for(route_id, kind);
        self.add(slot, delta);
    }

    pub fn value(&mut self, route_id: u64, kind: CounterKind) -> u64 {
        let slot = self.slot_for(route_id, kind);
        self.get(slot)
    }

    pub fn incr_overflow(&mut self) {
        self.add(OVERFLOWS_SLOT, 1);
    }

    pub fn overflows(&self) -> u64 {
        self.get(OVERFLOWS_SLOT)
    }

    pub fn incr_connections_opened(&mut self) {
        self.add(CONNECTIONS_OPENED_SLOT, 1);
    }

    pub fn connections_opened(&self) -> u64 {
        self.get(CONNECTIONS_OPENED_SLOT)
    }

    pub fn incr_connections_closed(&mut self) {
        self.add(CONNECTIONS_CLOSED_SLOT, 1);
    }

    pub fn connections_closed(&self) -> u64 {
        self.get(CONNECTIONS_CLOSED_SLOT)
    }

    pub fn open_connections(&self) -> u64 {
        self.connections_opened().saturating_sub(self.connections_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_route() {
        let mut counters = TcpCounters::new_in_memory(16);
        counters.incr(1, CounterKind::BytesRead, 5);
        counters.incr(1, CounterKind::BytesRead, 6);
        counters.incr(2, CounterKind::BytesRead, 100);
        assert_eq!(counters.value(1, CounterKind::BytesRead), 11);
        assert_eq!(counters.value(2, CounterKind::BytesRead), 100);
    }

    #[test]
    fn connection_lifecycle_counters() {
        let mut counters = TcpCounters::new_in_memory(16);
        counters.incr_connections_opened();
        counters.incr_connections_opened();
        counters.incr_connections_closed();
        assert_eq!(counters.open_connections(), 1);
    }

    #[test]
    fn overflow_counter_is_process_wide() {
        let mut counters = TcpCounters::new_in_memory(16);
        counters.incr_overflow();
        counters.incr_overflow();
        assert_eq!(counters.overflows(), 2);
    }
}
