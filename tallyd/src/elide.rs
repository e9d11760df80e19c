//! Suppression of repeated zero-valued metrics.
//!
//! Sinks that pay per data point do not want a quiet counter re-sent as `0`
//! every flush. The map tracks, per emitted name, how many consecutive
//! flushes the value has been zero; the sink emits only every `interval`
//! flushes of a zero run. The `skip` offset is drawn at random per process so
//! a fleet of daemons does not emit its zeroes in lockstep.

use hashbrown::HashMap;

struct ElideEntry {
    generations: u32,
    last_seen: u64,
}

/// Zero-run state per metric name.
pub struct ElideMap {
    entries: HashMap<String, ElideEntry>,
    skip: u32,
}

impl ElideMap {
    /// Creates an empty map with the given jitter offset.
    pub fn new(skip: u32) -> ElideMap {
        ElideMap { entries: HashMap::new(), skip }
    }

    /// The jitter offset this map was created with.
    pub fn skip(&self) -> u32 {
        self.skip
    }

    /// Records a zero-valued flush for `name` and returns the incremented
    /// generation count. New entries start at the skip offset, so the first
    /// emission of a zero run lands `interval` flushes in.
    pub fn mark(&mut self, name: &str, now: u64) -> u32 {
        let entry = self
            .entries
            .entry_ref(name)
            .or_insert(ElideEntry { generations: self.skip, last_seen: now });
        entry.last_seen = now;
        entry.generations = entry.generations.wrapping_add(1);
        entry.generations
    }

    /// Records a non-zero flush for `name`, resetting its zero run.
    pub fn unmark(&mut self, name: &str, now: u64) -> u32 {
        let entry = self
            .entries
            .entry_ref(name)
            .or_insert(ElideEntry { generations: self.skip, last_seen: now });
        entry.last_seen = now;
        entry.generations = self.skip;
        self.skip
    }

    /// Drops entries not seen since `cutoff`, returning how many went away.
    pub fn gc(&mut self, cutoff: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_seen > cutoff);
        before - self.entries.len()
    }

    /// Number of tracked names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is tracking nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::ElideMap;

    /// The sink-side emission rule.
    fn emits(map: &mut ElideMap, name: &str, value: f64, interval: u32, now: u64) -> bool {
        if value == 0.0 {
            map.mark(name, now) % interval == map.skip()
        } else {
            map.unmark(name, now);
            true
        }
    }

    #[test]
    fn zero_run_emits_every_interval() {
        let interval = 3;
        for skip in 0..interval {
            let mut map = ElideMap::new(skip);
            let emitted: Vec<bool> =
                (1..=9).map(|k| emits(&mut map, "m", 0.0, interval, k)).collect();
            // Flushes are 1-based: emission on k = 3, 6, 9.
            assert_eq!(
                emitted,
                vec![false, false, true, false, false, true, false, false, true],
                "skip {skip}"
            );
        }
    }

    #[test]
    fn non_zero_resets_the_run() {
        let interval = 3;
        let mut map = ElideMap::new(1);

        assert!(!emits(&mut map, "m", 0.0, interval, 1));
        assert!(!emits(&mut map, "m", 0.0, interval, 2));
        assert!(emits(&mut map, "m", 5.0, interval, 3));
        // The zero run starts over.
        assert!(!emits(&mut map, "m", 0.0, interval, 4));
        assert!(!emits(&mut map, "m", 0.0, interval, 5));
        assert!(emits(&mut map, "m", 0.0, interval, 6));
    }

    #[test]
    fn names_are_independent() {
        let interval = 2;
        let mut map = ElideMap::new(0);

        assert!(!emits(&mut map, "a", 0.0, interval, 1));
        assert!(emits(&mut map, "b", 1.0, interval, 1));
        assert!(emits(&mut map, "a", 0.0, interval, 2));
    }

    #[test]
    fn gc_drops_stale_entries() {
        let mut map = ElideMap::new(0);
        map.mark("old", 100);
        map.mark("new", 200);
        assert_eq!(map.len(), 2);

        assert_eq!(map.gc(100), 1);
        assert_eq!(map.len(), 1);

        // Surviving entry keeps its run position.
        assert_eq!(map.mark("new", 201), 2);
    }

    #[test]
    fn unmark_returns_skip() {
        let mut map = ElideMap::new(7);
        assert_eq!(map.unmark("m", 1), 7);
        map.mark("m", 2);
        map.mark("m", 3);
        assert_eq!(map.unmark("m", 4), 7);
        assert_eq!(map.mark("m", 5), 8);
    }
}
