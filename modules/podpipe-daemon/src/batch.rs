//! Tracks in-flight batches so the daemon can detect when the last job in
//! a batch has landed and hand the GPU off deterministically.

use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct BatchTracker {
    completed: HashMap<String, HashSet<String>>,
}

impl BatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `episode_id` finished within `batch_id`. Returns the
    /// full set of completed episode ids, sorted, once
    /// `|completed| >= total_batch_count` — at which point the caller
    /// must publish `BatchTranscribed` and drop the entry.
    pub fn record_completion(
        &mut self,
        batch_id: &str,
        episode_id: &str,
        total_batch_count: u32,
    ) -> Option<Vec<String>> {
        let set = self.completed.entry(batch_id.to_string()).or_default();
        set.insert(episode_id.to_string());

        if set.len() as u32 >= total_batch_count {
            let mut ids: Vec<String> = self.completed.remove(batch_id).unwrap().into_iter().collect();
            ids.sort();
            Some(ids)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_only_once_threshold_reached() {
        let mut tracker = BatchTracker::new();
        assert!(tracker.record_completion("b1", "ep-A", 2).is_none());
        let result = tracker.record_completion("b1", "ep-B", 2).unwrap();
        assert_eq!(result, vec!["ep-A".to_string(), "ep-B".to_string()]);
    }

    #[test]
    fn entry_is_dropped_after_completion() {
        let mut tracker = BatchTracker::new();
        tracker.record_completion("b1", "ep-A", 1);
        assert!(tracker.completed.get("b1").is_none());
    }

    #[test]
    fn duplicate_completion_does_not_double_count() {
        let mut tracker = BatchTracker::new();
        assert!(tracker.record_completion("b1", "ep-A", 2).is_none());
        assert!(tracker.record_completion("b1", "ep-A", 2).is_none());
        let result = tracker.record_completion("b1", "ep-B", 2).unwrap();
        assert_eq!(result.len(), 2);
    }
}
