//! Per-type in-flight accounting and the stable slot-number pool.

use std::collections::{BTreeSet, HashMap};

/// Tracks, per job-type, how many children are currently running versus the
/// declared capacity, and hands out stable integer slot numbers `1..=N`
/// (`N = Σ capacity_by_type`) so process names and log file paths are
/// predictable across restarts.
#[derive(Debug, Clone)]
pub struct SlotPool {
    capacity_by_type: HashMap<String, u32>,
    in_flight_by_type: HashMap<String, u32>,
    free_numbers: BTreeSet<u32>,
}

impl SlotPool {
    pub fn new(capacity_by_type: HashMap<String, u32>) -> Self {
        let total: u32 = capacity_by_type.values().sum();
        Self {
            capacity_by_type,
            in_flight_by_type: HashMap::new(),
            free_numbers: (1..=total).collect(),
        }
    }

    pub fn total_capacity(&self) -> u32 {
        self.capacity_by_type.values().sum()
    }

    pub fn in_flight_total(&self) -> u32 {
        self.in_flight_by_type.values().sum()
    }

    /// Number of free slot numbers; invariant: `free_numbers + in_flight_total == N`.
    pub fn free_count(&self) -> usize {
        self.free_numbers.len()
    }

    pub fn in_flight_by_type(&self) -> HashMap<String, u32> {
        self.in_flight_by_type.clone()
    }

    /// `capacity_by_type[t] − in_flight_by_type.get(t, 0)` for every type
    /// with capacity > 0.
    pub fn available_by_type(&self) -> HashMap<String, u32> {
        self.capacity_by_type
            .iter()
            .filter(|(_, cap)| **cap > 0)
            .map(|(t, cap)| {
                let in_flight = self.in_flight_by_type.get(t).copied().unwrap_or(0);
                (t.clone(), cap.saturating_sub(in_flight))
            })
            .collect()
    }

    pub fn eligible_types(&self) -> std::collections::BTreeSet<String> {
        self.available_by_type()
            .into_iter()
            .filter(|(_, avail)| *avail > 0)
            .map(|(t, _)| t)
            .collect()
    }

    /// Pop the smallest free slot number and account it against `job_type`.
    ///
    /// # Panics
    /// Panics if no free slot numbers remain. Callers must have checked
    /// [`available_by_type`](Self::available_by_type) first; acquiring
    /// without checking availability is a caller bug, not a runtime
    /// condition to recover from.
    pub fn acquire(&mut self, job_type: &str) -> u32 {
        let slot = *self
            .free_numbers
            .iter()
            .next()
            .expect("acquire called with no free slot numbers");
        self.free_numbers.remove(&slot);
        *self.in_flight_by_type.entry(job_type.to_string()).or_insert(0) += 1;
        slot
    }

    pub fn release(&mut self, slot_number: u32, job_type: &str) {
        self.free_numbers.insert(slot_number);
        if let Some(count) = self.in_flight_by_type.get_mut(job_type) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight_by_type.remove(job_type);
            }
        }
    }
}
