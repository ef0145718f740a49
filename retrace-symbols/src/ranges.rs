use std::ops::Range;

/// A structure containing a set of disjoint half-open ranges with attached
/// contents.
///
/// Functions, source lines and CFI records within one module must not
/// overlap; this map enforces that on insertion and answers address queries
/// in `O(log n)`. Lookups resolve half-open ranges, so a query at the shared
/// boundary of two adjacent ranges yields the later one.
#[derive(Clone, Debug)]
pub struct RangeMap<A, E> {
    inner: Vec<(Range<A>, E)>,
}

impl<A: Ord + Copy, E> RangeMap<A, E> {
    /// Inserts a range into the map.
    ///
    /// The range must be disjoint from all ranges that are already present.
    /// Returns true if the insertion was successful.
    pub fn insert(&mut self, range: Range<A>, contents: E) -> bool {
        if let Some(i) = self.free_slot(&range) {
            self.inner.insert(i, (range, contents));
            true
        } else {
            false
        }
    }

    /// Returns the position in the inner vector where the given range could
    /// be inserted, if that is possible.
    fn free_slot(&self, range: &Range<A>) -> Option<usize> {
        let index = match self.inner.binary_search_by_key(&range.end, |r| r.0.end) {
            Ok(_) => return None,
            Err(index) => index,
        };

        if index > 0 {
            let before = &self.inner[index - 1];
            if before.0.end > range.start {
                return None;
            }
        }

        match self.inner.get(index) {
            Some(after) if after.0.start < range.end => None,
            _ => Some(index),
        }
    }

    /// Retrieves the range covering the given address and the associated
    /// contents.
    pub fn get(&self, address: A) -> Option<&(Range<A>, E)> {
        let entry = match self
            .inner
            .binary_search_by_key(&address, |range| range.0.end)
        {
            // inner[index].end == address, so the address can only be covered
            // by the next range (ranges are half-open).
            Ok(index) => self.inner.get(index + 1)?,
            // inner[index].end > address, so this could be the one.
            Err(index) => self.inner.get(index)?,
        };

        (entry.0.start <= address).then_some(entry)
    }

    /// Retrieves the range covering the given address, allowing mutation.
    pub fn get_mut(&mut self, address: A) -> Option<&mut (Range<A>, E)> {
        let entry = match self
            .inner
            .binary_search_by_key(&address, |range| range.0.end)
        {
            Ok(index) => self.inner.get_mut(index + 1)?,
            Err(index) => self.inner.get_mut(index)?,
        };

        (entry.0.start <= address).then_some(entry)
    }

    /// Retrieves the contents associated with the given address.
    pub fn get_contents(&self, address: A) -> Option<&E> {
        self.get(address).map(|(_, contents)| contents)
    }

    /// Retrieves the contents associated with the given address, allowing
    /// mutation.
    pub fn get_contents_mut(&mut self, address: A) -> Option<&mut E> {
        self.get_mut(address).map(|(_, contents)| contents)
    }

    /// Returns true if the given address is covered by some range in the map.
    pub fn contains(&self, address: A) -> bool {
        self.get(address).is_some()
    }

    /// Returns an iterator over all ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &(Range<A>, E)> {
        self.inner.iter()
    }

    /// The number of ranges in the map.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the map contains no ranges.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<A, E> Default for RangeMap<A, E> {
    fn default() -> Self {
        Self { inner: Vec::new() }
    }
}
