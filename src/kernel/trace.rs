//! Scheduler tracing
//!
//! Provides a bounded record of what the scheduler did, for debugging and
//! for asserting on scheduling order in tests.
//!
//! Design:
//! - Typed events with a monotonic sequence number
//! - Ring buffer for recent events (bounded memory)
//! - Counters survive ring eviction

use super::thread::ThreadId;
use super::Priority;
use serde::Serialize;
use std::collections::VecDeque;

/// Trace event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceCategory {
    /// Thread lifecycle (create, exit, reap)
    Lifecycle,
    /// Context switches and queue moves
    Scheduler,
    /// Quantum expiry handling
    Preempt,
}

impl std::fmt::Display for TraceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceCategory::Lifecycle => write!(f, "LIFECYCLE"),
            TraceCategory::Scheduler => write!(f, "SCHED"),
            TraceCategory::Preempt => write!(f, "PREEMPT"),
        }
    }
}

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TraceKind {
    Created { id: ThreadId, priority: Priority },
    Switched { from: ThreadId, to: ThreadId },
    Yielded(ThreadId),
    Blocked(ThreadId),
    Woke(ThreadId),
    PriorityChanged { id: ThreadId, from: Priority, to: Priority },
    Exited { id: ThreadId, status: i64 },
    Reaped(ThreadId),
    PreemptRequested(ThreadId),
    PreemptSuppressed(ThreadId),
    Preempted(ThreadId),
}

impl TraceKind {
    pub fn category(&self) -> TraceCategory {
        match self {
            TraceKind::Created { .. } | TraceKind::Exited { .. } | TraceKind::Reaped(_) => {
                TraceCategory::Lifecycle
            }
            TraceKind::PreemptRequested(_)
            | TraceKind::PreemptSuppressed(_)
            | TraceKind::Preempted(_) => TraceCategory::Preempt,
            _ => TraceCategory::Scheduler,
        }
    }
}

/// A single trace event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub seq: u64,
    pub category: TraceCategory,
    pub kind: TraceKind,
}

impl std::fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} [{}] {:?}", self.seq, self.category, self.kind)
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedStats {
    pub created: u64,
    pub switches: u64,
    pub yields: u64,
    pub wakes: u64,
    pub exits: u64,
    pub reaped: u64,
    pub preemptions: u64,
    pub suppressed_preemptions: u64,
}

/// Bounded event log plus counters
#[derive(Debug)]
pub struct TraceBuffer {
    events: VecDeque<TraceEvent>,
    capacity: usize,
    next_seq: u64,
    stats: SchedStats,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_seq: 0,
            stats: SchedStats::default(),
        }
    }

    /// Record an event, evicting the oldest when full
    pub fn record(&mut self, kind: TraceKind) {
        match &kind {
            TraceKind::Created { .. } => self.stats.created += 1,
            TraceKind::Switched { .. } => self.stats.switches += 1,
            TraceKind::Yielded(_) => self.stats.yields += 1,
            TraceKind::Woke(_) => self.stats.wakes += 1,
            TraceKind::Exited { .. } => self.stats.exits += 1,
            TraceKind::Reaped(_) => self.stats.reaped += 1,
            TraceKind::Preempted(_) => self.stats.preemptions += 1,
            TraceKind::PreemptSuppressed(_) => self.stats.suppressed_preemptions += 1,
            _ => {}
        }

        if self.capacity == 0 {
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        let event = TraceEvent {
            seq: self.next_seq,
            category: kind.category(),
            kind,
        };
        self.next_seq += 1;
        self.events.push_back(event);
    }

    pub fn events(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter()
    }

    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn stats(&self) -> &SchedStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let mut trace = TraceBuffer::new(10);
        trace.record(TraceKind::Created {
            id: ThreadId(2),
            priority: 3,
        });
        trace.record(TraceKind::Switched {
            from: ThreadId(0),
            to: ThreadId(2),
        });

        let events = trace.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[0].category, TraceCategory::Lifecycle);
        assert_eq!(events[1].category, TraceCategory::Scheduler);
        assert_eq!(trace.stats().created, 1);
        assert_eq!(trace.stats().switches, 1);
    }

    #[test]
    fn test_ring_eviction_keeps_counters() {
        let mut trace = TraceBuffer::new(3);
        for i in 0..5 {
            trace.record(TraceKind::Yielded(ThreadId(i)));
        }
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.stats().yields, 5);
        let first = trace.events().next().unwrap();
        assert_eq!(first.seq, 2);
    }

    #[test]
    fn test_zero_capacity_only_counts() {
        let mut trace = TraceBuffer::new(0);
        trace.record(TraceKind::PreemptSuppressed(ThreadId(1)));
        assert!(trace.is_empty());
        assert_eq!(trace.stats().suppressed_preemptions, 1);
    }

    #[test]
    fn test_event_display() {
        let mut trace = TraceBuffer::new(4);
        trace.record(TraceKind::Reaped(ThreadId(4)));
        let line = format!("{}", trace.events().next().unwrap());
        assert!(line.starts_with("#0 [LIFECYCLE]"));
    }
}
