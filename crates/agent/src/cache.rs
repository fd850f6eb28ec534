//! Prompt-cache boundary bookkeeping.
//!
//! Two messages of each request get a cache marker. The second always sits
//! on the newest message; the first trails at the position the previous
//! request's second marker used, so the prefix cached last time is read back.

use swerve_core::message::ModelMessage;

/// Where the two cache markers go, carried across the requests of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBoundaries {
    first: usize,
    second: usize,
}

impl CacheBoundaries {
    /// Boundaries for the first request of a turn over `len` messages.
    ///
    /// The previous turn usually cached up to its last tool result, which is
    /// three messages back: the newest is the user's new message, the one
    /// before it the previous final answer.
    pub fn initial(len: usize) -> Self {
        let first = if len > 2 { len - 3 } else { len.saturating_sub(1) };
        Self { first, second: 0 }
    }

    /// Start over after elision; any cached prefix is gone.
    pub fn reset(&mut self, len: usize) {
        let last = len.saturating_sub(1);
        self.first = last;
        self.second = last;
    }

    pub fn first(&self) -> usize {
        self.first
    }

    pub fn second(&self) -> usize {
        self.second
    }

    /// Mark the cache positions on `messages` and slide the first boundary
    /// forward for the next request. Returns the marked positions.
    pub fn place(&mut self, messages: &mut [ModelMessage]) -> Vec<usize> {
        if messages.is_empty() {
            return Vec::new();
        }
        let last = messages.len() - 1;
        self.second = last;
        self.first = self.first.min(last);

        let mut positions = vec![self.first, self.second];
        positions.dedup();
        for &i in &positions {
            messages[i].mark_cache_point();
        }

        self.first = self.second;
        positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swerve_core::message::{ContentBlock, Role};

    fn messages(n: usize) -> Vec<ModelMessage> {
        (0..n)
            .map(|i| ModelMessage {
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: vec![ContentBlock::text(format!("m{i}"))],
            })
            .collect()
    }

    fn markers(messages: &[ModelMessage]) -> Vec<usize> {
        messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.has_cache_point())
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn initial_trails_by_two() {
        assert_eq!(CacheBoundaries::initial(10).first(), 7);
        assert_eq!(CacheBoundaries::initial(2).first(), 1);
        assert_eq!(CacheBoundaries::initial(1).first(), 0);
        assert_eq!(CacheBoundaries::initial(0).first(), 0);
    }

    #[test]
    fn first_slides_to_previous_second() {
        let mut cache = CacheBoundaries::initial(5);
        let mut msgs = messages(5);
        assert_eq!(cache.place(&mut msgs), vec![2, 4]);
        assert_eq!(markers(&msgs), vec![2, 4]);

        // Two records appended by a tool round
        let mut msgs = messages(7);
        assert_eq!(cache.place(&mut msgs), vec![4, 6]);
    }

    #[test]
    fn duplicate_positions_mark_once() {
        let mut cache = CacheBoundaries::initial(1);
        let mut msgs = messages(1);
        assert_eq!(cache.place(&mut msgs), vec![0]);
        let cache_points = msgs[0]
            .content
            .iter()
            .filter(|b| matches!(b, ContentBlock::CachePoint))
            .count();
        assert_eq!(cache_points, 1);
    }

    #[test]
    fn reset_stays_in_bounds_after_shrink() {
        let mut cache = CacheBoundaries::initial(40);
        let mut long = messages(40);
        cache.place(&mut long);
        assert_eq!(cache.first(), 39);

        for shorter in [1usize, 3, 12] {
            let mut msgs = messages(shorter);
            cache.reset(shorter);
            let placed = cache.place(&mut msgs);
            assert!(placed.iter().all(|&i| i < shorter));
            assert_eq!(placed, vec![shorter - 1]);
        }
    }

    #[test]
    fn empty_list_places_nothing() {
        let mut cache = CacheBoundaries::initial(0);
        assert!(cache.place(&mut []).is_empty());
    }
}
