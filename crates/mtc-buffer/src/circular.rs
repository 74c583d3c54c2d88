//! The circular observation buffer
//!
//! A fixed ring of 2^k observations indexed by a strictly monotonic
//! sequence. Admission assigns the sequence, maintains the first/latest
//! checkpoints, cuts periodic checkpoints, and signals data-item observers.
//! Rejected admissions (a filter on the data item suppressed the value)
//! return sequence 0.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use tracing::trace;

use mtc_model::{DataItem, Filter, Observation, Value};

use crate::checkpoint::Checkpoint;

pub struct CircularBuffer {
    capacity: usize,
    checkpoint_frequency: u64,
    slots: VecDeque<Arc<Observation>>,
    /// Sequence the next admission receives; sequence 0 is never assigned
    next_sequence: u64,
    /// Sequence of the oldest retained observation
    first_sequence: u64,
    /// Rolling latest-per-item view of the whole history
    latest: Checkpoint,
    /// State of the world just before `first_sequence`
    first: Checkpoint,
    /// Periodic snapshots: (sequence of the last folded observation, state)
    checkpoints: VecDeque<(u64, Checkpoint)>,
    admissions_since_checkpoint: u64,
}

impl CircularBuffer {
    /// `size_exponent` is k; the ring holds 2^k observations.
    pub fn new(size_exponent: u8, checkpoint_frequency: u64) -> Self {
        Self {
            capacity: 1usize << size_exponent,
            checkpoint_frequency,
            slots: VecDeque::new(),
            next_sequence: 1,
            first_sequence: 1,
            latest: Checkpoint::new(),
            first: Checkpoint::new(),
            checkpoints: VecDeque::new(),
            admissions_since_checkpoint: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Sequence of the oldest retained observation
    pub fn first_sequence(&self) -> u64 {
        self.first_sequence
    }

    /// Sequence the next admission will receive
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Admit an observation: assign the next sequence, store, advance,
    /// checkpoint, signal observers. Returns 0 when a filter rejected it.
    pub fn add_to_buffer(&mut self, observation: Arc<Observation>) -> u64 {
        if let Some(item) = observation.data_item() {
            if self.is_filtered(&item, &observation) {
                trace!(data_item = item.id(), "observation filtered out");
                return 0;
            }
        }

        let sequence = self.next_sequence;
        observation.assign_sequence(sequence);
        self.next_sequence += 1;

        self.slots.push_back(Arc::clone(&observation));
        if self.slots.len() > self.capacity {
            let expired = self.slots.pop_front().expect("ring not empty");
            self.first.add(&expired);
            self.first_sequence = self.slots.front().expect("ring not empty").sequence();
        }

        self.latest.add(&observation);

        self.admissions_since_checkpoint += 1;
        let wrapped = sequence % self.capacity as u64 == 0;
        if self.admissions_since_checkpoint >= self.checkpoint_frequency || wrapped {
            self.checkpoints.push_back((sequence, self.latest.clone()));
            self.admissions_since_checkpoint = 0;
        }
        // checkpoints older than the window can no longer seed a replay
        while let Some((seq, _)) = self.checkpoints.front() {
            if *seq + 1 < self.first_sequence {
                self.checkpoints.pop_front();
            } else {
                break;
            }
        }

        if let Some(item) = observation.data_item() {
            item.signal_observers(sequence);
        }

        sequence
    }

    fn is_filtered(&self, item: &Arc<DataItem>, observation: &Arc<Observation>) -> bool {
        // conditions and discrete items always pass
        if item.is_condition() || item.is_discrete() || item.filters().is_empty() {
            return false;
        }
        let Some(last) = self.latest.get(item.id()) else {
            return false;
        };
        if last.is_unavailable() != observation.is_unavailable() {
            return false;
        }

        for filter in item.filters() {
            match filter {
                Filter::Duplicate => {
                    if last.value() == observation.value() {
                        return true;
                    }
                }
                Filter::MinimumDelta(delta) => {
                    if let (Value::Sample(previous), Value::Sample(current)) =
                        (last.value(), observation.value())
                    {
                        if (current - previous).abs() < *delta {
                            return true;
                        }
                    }
                }
                Filter::Period(seconds) => {
                    let elapsed = observation
                        .timestamp()
                        .signed_duration_since(last.timestamp());
                    if elapsed.num_milliseconds() < (seconds * 1000.0) as i64 {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Observations with sequence in `[from, from+count)`, clamped to the
    /// window. Returns (first retained sequence, observations, sequence to
    /// resume from).
    pub fn get_from(&self, from: u64, count: usize) -> (u64, Vec<Arc<Observation>>, u64) {
        let start = from.max(self.first_sequence);
        let list: Vec<_> = self
            .slots
            .iter()
            .skip_while(|obs| obs.sequence() < start)
            .take(count)
            .cloned()
            .collect();
        let next = list.last().map(|o| o.sequence() + 1).unwrap_or(start);
        (self.first_sequence, list, next)
    }

    /// Latest merged value for one data item
    pub fn get_latest(&self, data_item_id: &str) -> Option<Arc<Observation>> {
        self.latest.get(data_item_id)
    }

    /// Latest-per-item view of everything currently known
    pub fn latest_checkpoint(&self) -> &Checkpoint {
        &self.latest
    }

    /// Reconstruct the latest-per-item state at sequence `at`: copy the
    /// nearest preceding checkpoint and replay the window up to `at`.
    pub fn checkpoint_at(&self, at: u64) -> Checkpoint {
        let at = at.min(self.next_sequence.saturating_sub(1));

        let (base_seq, mut checkpoint) = self
            .checkpoints
            .iter()
            .rev()
            .find(|(seq, _)| *seq <= at)
            .map(|(seq, cp)| (*seq, cp.clone()))
            .unwrap_or_else(|| (self.first_sequence.saturating_sub(1), self.first.clone()));

        for observation in &self.slots {
            let seq = observation.sequence();
            if seq > base_seq && seq <= at {
                checkpoint.add(observation);
            }
        }
        checkpoint
    }

    /// Rebind every retained observation and checkpoint entry after a device
    /// replace swapped data-item objects behind stable ids.
    pub fn update_data_items(&mut self, map: &AHashMap<String, Weak<DataItem>>) {
        for observation in &self.slots {
            if let Some(item) = map.get(observation.data_item_id()).and_then(Weak::upgrade) {
                observation.rebind_data_item(&item);
            }
        }
        self.latest.update_data_items(map);
        self.first.update_data_items(map);
        for (_, checkpoint) in &mut self.checkpoints {
            checkpoint.update_data_items(map);
        }
    }
}
