//! Event timeline for instrumenting the frame pipeline.
//!
//! Every event gets a sequence number from one shared counter taken under the same lock
//! that appends it, so sequence order is a total order consistent with real time across
//! the CPU threads and the GPU queue threads.

use parking_lot::Mutex;
use web_time::Instant;

use super::QueueKind;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimelineEventKind {
    /// A CPU-side pipeline stage (label names the stage).
    Cpu,
    /// A command list finished executing on a queue.
    Executed,
    /// A queue wait on a fence was satisfied and the queue continued.
    WaitSatisfied,
    /// A queue signal completed.
    Signaled,
    /// A swap-chain image was presented.
    Presented,
}

/// A single recorded event.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Position in the total order of events.
    pub sequence: u64,
    /// Event kind.
    pub kind: TimelineEventKind,
    /// Queue that produced the event, `None` for CPU events.
    pub queue: Option<QueueKind>,
    /// Command list label, fence label or stage name.
    pub label: String,
    /// Fence value or frame counter.
    pub value: u64,
    /// Wall-clock time of the event.
    pub at: Instant,
}

/// Thread-safe, append-only event log.
#[derive(Debug, Default)]
pub struct Timeline {
    events: Mutex<Vec<TimelineEvent>>,
}

impl Timeline {
    /// Creates an empty timeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event and returns its sequence number.
    pub fn record(&self, kind: TimelineEventKind, queue: Option<QueueKind>, label: impl Into<String>, value: u64) -> u64 {
        let mut events = self.events.lock();
        let sequence = events.len() as u64;
        events.push(TimelineEvent {
            sequence,
            kind,
            queue,
            label: label.into(),
            value,
            at: Instant::now(),
        });
        sequence
    }

    /// Records a CPU stage.
    pub fn cpu(&self, stage: impl Into<String>, frame_counter: u64) -> u64 {
        self.record(TimelineEventKind::Cpu, None, stage, frame_counter)
    }

    /// Snapshot of every event so far.
    pub fn events(&self) -> Vec<TimelineEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// `true` when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Forgets all events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Sequence number of the first event matching `kind` whose label starts with
    /// `label_prefix`.
    pub fn first(&self, kind: TimelineEventKind, label_prefix: &str) -> Option<u64> {
        self.events
            .lock()
            .iter()
            .find(|event| event.kind == kind && event.label.starts_with(label_prefix))
            .map(|event| event.sequence)
    }

    /// Sequence number of the last event matching `kind` whose label starts with
    /// `label_prefix`.
    pub fn last(&self, kind: TimelineEventKind, label_prefix: &str) -> Option<u64> {
        self.events
            .lock()
            .iter()
            .rev()
            .find(|event| event.kind == kind && event.label.starts_with(label_prefix))
            .map(|event| event.sequence)
    }

    /// Every event matching `kind` whose label starts with `label_prefix`.
    pub fn matching(&self, kind: TimelineEventKind, label_prefix: &str) -> Vec<TimelineEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind == kind && event.label.starts_with(label_prefix))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_follow_insertion_order() {
        let timeline = Timeline::new();
        let a = timeline.cpu("capture", 0);
        let b = timeline.record(TimelineEventKind::Executed, Some(QueueKind::Copy), "frame 0 copy", 0);
        assert!(a < b);
        assert_eq!(timeline.first(TimelineEventKind::Executed, "frame 0"), Some(b));
        assert_eq!(timeline.last(TimelineEventKind::Cpu, "capture"), Some(a));
        assert_eq!(timeline.len(), 2);
    }
}
