//! Bounded probe history kept per endpoint and per test URL.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Samples retained per ring; older entries are evicted first.
pub const HISTORY_SIZE: usize = 10;

/// One probe observation. A `delay` of zero and a `speed` of zero both read
/// as "no measurement".
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Sample {
    #[serde(serialize_with = "unix_millis")]
    pub time: SystemTime,
    pub delay: u16,
    pub speed: f64,
}

impl Sample {
    pub fn zero() -> Self {
        Self {
            time: UNIX_EPOCH,
            delay: 0,
            speed: 0.0,
        }
    }
}

fn unix_millis<S: serde::Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    let ms = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    s.serialize_u64(ms)
}

/// Fixed-capacity FIFO of samples. One writer (the probing task) and many
/// readers (selectors, serializers); the critical section is a few pointer
/// moves, so a plain mutex is enough.
#[derive(Debug, Default)]
pub struct HistoryRing {
    samples: Mutex<VecDeque<Sample>>,
}

impl HistoryRing {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(HISTORY_SIZE)),
        }
    }

    pub fn push(&self, sample: Sample) {
        let mut q = self.samples.lock();
        q.push_back(sample);
        if q.len() > HISTORY_SIZE {
            q.pop_front();
        }
    }

    /// Most recent sample, or the zero sample when nothing was recorded yet.
    pub fn last(&self) -> Sample {
        self.samples.lock().back().cloned().unwrap_or_else(Sample::zero)
    }

    /// Copy in insertion order, for serialization.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}
