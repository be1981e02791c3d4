use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use dura_types::{SeqNum, SeqRange};

use crate::layer::DataLayer;

/// One slot of a [`Mapping`], holding a reference on its layer for as long
/// as the entry lives.
pub struct Entry {
    layer: Arc<DataLayer>,
}

impl Entry {
    fn new(layer: &Arc<DataLayer>) -> Self {
        layer.attach();
        Self {
            layer: Arc::clone(layer),
        }
    }

    pub fn layer(&self) -> &Arc<DataLayer> {
        &self.layer
    }

    pub fn range(&self) -> SeqRange {
        self.layer.range()
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        DataLayer::detach(&self.layer);
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Entry").field(&self.layer.range()).finish()
    }
}

/// An immutable, ordered view of a repository's layers.
///
/// Entries are keyed by the lowest sequence number of their layer and are
/// neighborly: each entry's range ends strictly before the next one begins.
pub struct Mapping {
    generation: u64,
    entries: BTreeMap<SeqNum, Entry>,
}

impl Mapping {
    pub fn empty(generation: u64) -> Self {
        Self {
            generation,
            entries: BTreeMap::new(),
        }
    }

    /// Build a mapping over `layers`, attaching each one.
    pub fn new<'a>(generation: u64, layers: impl IntoIterator<Item = &'a Arc<DataLayer>>) -> Self {
        let mut entries = BTreeMap::new();
        for layer in layers {
            let previous = entries.insert(layer.range().lowest, Entry::new(layer));
            debug_assert!(previous.is_none(), "two layers start at {}", layer.range().lowest);
        }
        let mapping = Self {
            generation,
            entries,
        };
        debug_assert!(mapping.is_neighborly(), "mapping is not neighborly: {mapping:?}");
        mapping
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in sequence order.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn layers(&self) -> impl DoubleEndedIterator<Item = &Arc<DataLayer>> {
        self.entries.values().map(Entry::layer)
    }

    pub fn ranges(&self) -> Vec<SeqRange> {
        self.entries.values().map(Entry::range).collect()
    }

    /// The entry immediately before `entry`.
    pub fn prev(&self, entry: &Entry) -> Option<&Entry> {
        self.entries
            .range(..entry.range().lowest)
            .next_back()
            .map(|(_, e)| e)
    }

    /// The entry immediately after `entry`.
    pub fn next(&self, entry: &Entry) -> Option<&Entry> {
        self.entries
            .range((Bound::Excluded(entry.range().lowest), Bound::Unbounded))
            .next()
            .map(|(_, e)| e)
    }

    /// Every adjacent pair satisfies `prev.highest < next.lowest`.
    pub fn is_neighborly(&self) -> bool {
        let ranges = self.ranges();
        ranges.windows(2).all(|pair| pair[0].precedes(&pair[1]))
    }

    /// Highest sequence number covered, if any layer exists.
    pub fn highest(&self) -> Option<SeqNum> {
        self.entries.values().next_back().map(|e| e.range().highest)
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("generation", &self.generation)
            .field("ranges", &self.ranges())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dura_types::DurableId;
    use proptest::prelude::*;

    use crate::files::InMemoryLayerFiles;
    use crate::removal::RemovalQueue;

    fn queue() -> Arc<RemovalQueue> {
        Arc::new(RemovalQueue::new(Arc::new(InMemoryLayerFiles::new())))
    }

    fn layer(queue: &Arc<RemovalQueue>, lowest: SeqNum, highest: SeqNum) -> Arc<DataLayer> {
        DataLayer::new_mem(
            DurableId::new(),
            SeqRange::new(lowest, highest).unwrap(),
            Vec::new(),
            queue,
        )
    }

    #[test]
    fn entries_hold_references() {
        let q = queue();
        let a = layer(&q, 1, 3);
        let b = layer(&q, 4, 4);
        let first = Mapping::new(1, [&a, &b]);
        let second = Mapping::new(2, [&b]);
        assert_eq!(a.ref_count(), 1);
        assert_eq!(b.ref_count(), 2);
        drop(first);
        assert_eq!(a.ref_count(), 0);
        assert_eq!(b.ref_count(), 1);
        drop(second);
        assert_eq!(b.ref_count(), 0);
    }

    #[test]
    fn neighbors() {
        let q = queue();
        let layers = [layer(&q, 1, 2), layer(&q, 3, 5), layer(&q, 8, 9)];
        let mapping = Mapping::new(1, layers.iter());
        let middle = mapping.entries().nth(1).unwrap();
        assert_eq!(mapping.prev(middle).unwrap().range(), layers[0].range());
        assert_eq!(mapping.next(middle).unwrap().range(), layers[2].range());
        let first = mapping.entries().next().unwrap();
        assert!(mapping.prev(first).is_none());
        assert_eq!(mapping.highest(), Some(9));
    }

    #[test]
    fn empty_mapping() {
        let mapping = Mapping::empty(0);
        assert!(mapping.is_empty());
        assert!(mapping.is_neighborly());
        assert_eq!(mapping.highest(), None);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not neighborly")]
    fn overlapping_layers_are_rejected() {
        let q = queue();
        let a = layer(&q, 1, 5);
        let b = layer(&q, 5, 7);
        let _ = Mapping::new(1, [&a, &b]);
    }

    proptest! {
        #[test]
        fn disjoint_layers_are_neighborly(gaps in proptest::collection::vec((0u64..3, 0u64..4), 1..20)) {
            let q = queue();
            let mut next = 1;
            let mut layers = Vec::new();
            for (gap, len) in gaps {
                let lowest = next + gap;
                layers.push(layer(&q, lowest, lowest + len));
                next = lowest + len + 1;
            }
            // insertion order does not matter
            layers.reverse();
            let mapping = Mapping::new(1, layers.iter());
            prop_assert!(mapping.is_neighborly());
            prop_assert_eq!(mapping.len(), layers.len());
        }
    }
}
