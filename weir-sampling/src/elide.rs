use std::time::Instant;

use hashbrown::HashMap;

/// Tracks how many consecutive windows a metric key has been elidable.
///
/// Keys that report the same value window after window (typically zero
/// counters) do not need to be relayed every time. The elision map counts
/// consecutive elidable windows per key; the caller consults the returned
/// generation to decide whether the key is due for a real report.
///
/// The map never reads the clock itself. Callers pass `now` in, which keeps
/// elision decisions deterministic and testable.
///
/// # Example
///
/// ```
/// use std::time::Instant;
/// use weir_sampling::Elide;
///
/// let mut elide = Elide::new(0);
/// let now = Instant::now();
///
/// assert_eq!(elide.mark("idle.counter", now), 0);
/// assert_eq!(elide.mark("idle.counter", now), 1);
///
/// // The value changed; report it and restart the count.
/// elide.unmark("idle.counter", now);
/// assert_eq!(elide.mark("idle.counter", now), 0);
/// ```
#[derive(Debug)]
pub struct Elide {
    entries: HashMap<String, ElideEntry>,
    skip: u64,
}

#[derive(Debug)]
struct ElideEntry {
    /// Number of sequential elidable windows.
    generations: u64,
    last_seen: Instant,
}

impl Elide {
    /// Creates an empty elision map.
    ///
    /// All generations start at `skip`, which lets callers stagger when
    /// elided keys resurface across instances.
    pub fn new(skip: u64) -> Self {
        Self {
            entries: HashMap::new(),
            skip,
        }
    }

    /// Records that `key` elided again and returns its generation before
    /// this call.
    pub fn mark(&mut self, key: &str, now: Instant) -> u64 {
        let skip = self.skip;
        let entry = self
            .entries
            .entry_ref(key)
            .or_insert_with(|| ElideEntry {
                generations: skip,
                last_seen: now,
            });

        entry.last_seen = now;
        let generation = entry.generations;
        entry.generations += 1;
        generation
    }

    /// Resets `key` to its initial generation, forcing a report the next
    /// time it becomes elidable.
    ///
    /// Used when a key stops eliding, for example because its value
    /// changed.
    pub fn unmark(&mut self, key: &str, now: Instant) -> u64 {
        let skip = self.skip;
        let entry = self
            .entries
            .entry_ref(key)
            .or_insert_with(|| ElideEntry {
                generations: skip,
                last_seen: now,
            });

        entry.last_seen = now;
        entry.generations = skip;
        skip
    }

    /// Drops entries not seen after `cutoff` and returns how many were
    /// removed.
    pub fn gc(&mut self, cutoff: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_seen > cutoff);
        before - self.entries.len()
    }

    /// Returns the number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_mark_counts_generations() {
        let mut elide = Elide::new(0);
        let now = Instant::now();

        assert_eq!(elide.mark("foo", now), 0);
        assert_eq!(elide.mark("foo", now), 1);
        assert_eq!(elide.mark("foo", now), 2);
        assert_eq!(elide.mark("bar", now), 0);
        assert_eq!(elide.len(), 2);
    }

    #[test]
    fn test_skip_offsets_generations() {
        let mut elide = Elide::new(3);
        let now = Instant::now();

        assert_eq!(elide.mark("foo", now), 3);
        assert_eq!(elide.mark("foo", now), 4);
    }

    #[test]
    fn test_unmark_resets_generations() {
        let mut elide = Elide::new(2);
        let now = Instant::now();

        elide.mark("foo", now);
        elide.mark("foo", now);
        assert_eq!(elide.unmark("foo", now), 2);
        assert_eq!(elide.mark("foo", now), 2);
    }

    #[test]
    fn test_unmark_unknown_key_creates_entry() {
        let mut elide = Elide::new(0);
        let now = Instant::now();

        assert_eq!(elide.unmark("foo", now), 0);
        assert_eq!(elide.len(), 1);
    }

    #[test]
    fn test_gc_drops_stale_entries() {
        let mut elide = Elide::new(0);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(60);

        elide.mark("stale", t0);
        elide.mark("fresh", t1);

        assert_eq!(elide.gc(t0), 1);
        assert_eq!(elide.len(), 1);

        // The fresh key is still counted up.
        assert_eq!(elide.mark("fresh", t1), 1);
    }
}
