//! Run-scoped duplicate suppression across pages.

use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct DeduplicationIndex {
    seen: HashSet<(String, Option<String>)>,
}

impl DeduplicationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` the first time a (parent, establishment) pair is seen, `false` afterwards.
    pub fn observe(&mut self, parent_key: &str, establishment_key: Option<&str>) -> bool {
        self.seen
            .insert((parent_key.to_string(), establishment_key.map(str::to_string)))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sighting_is_rejected() {
        let mut index = DeduplicationIndex::new();
        assert!(index.observe("55", Some("55-0")));
        assert!(!index.observe("55", Some("55-0")));
        assert!(index.observe("55", Some("55-1")));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn parent_only_rows_use_their_own_slot() {
        let mut index = DeduplicationIndex::new();
        assert!(index.observe("55", None));
        assert!(index.observe("55", Some("55-0")));
        assert!(!index.observe("55", None));
    }
}
