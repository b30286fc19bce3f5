//! Rate limiting for repeated error reports.

use std::time::{Duration, Instant};

/// Occurrences always reported before throttling starts.
const ALWAYS_LOG: u64 = 3;
/// After that, one report per this many occurrences.
const LOG_EVERY: u64 = 10;
/// A source quiet for this long starts counting from zero again.
const RESET_AFTER: Duration = Duration::from_secs(60);

struct Entry {
    source: &'static str,
    count: u64,
    last: Instant,
}

/// Per-source occurrence counter deciding which reports reach the log.
///
/// Sources are registered up front so that [`LogThrottle::should_log`] never allocates.
pub struct LogThrottle {
    entries: Vec<Entry>,
}

impl LogThrottle {
    pub fn new(sources: &[&'static str]) -> Self {
        let now = Instant::now();
        Self {
            entries: sources
                .iter()
                .map(|&source| Entry {
                    source,
                    count: 0,
                    last: now,
                })
                .collect(),
        }
    }

    /// Records an occurrence and returns the running count when it should be logged.
    pub fn should_log(&mut self, source: &str, now: Instant) -> Option<u64> {
        let entry = self.entries.iter_mut().find(|e| e.source == source)?;
        if entry.count > 0 && now.saturating_duration_since(entry.last) > RESET_AFTER {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last = now;
        (entry.count <= ALWAYS_LOG || entry.count % LOG_EVERY == 0).then_some(entry.count)
    }
}
