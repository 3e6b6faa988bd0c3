use std::collections::VecDeque;

use crate::models::Track;

pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

/// Bounded FIFO of pending tracks for one guild.
///
/// The queue itself is not synchronized: it lives inside the guild's session state and is only
/// touched while the guild lock is held.
#[derive(Debug)]
pub struct GuildQueue {
    tracks: VecDeque<Track>,
    capacity: usize,
}

impl GuildQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            tracks: VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY)),
            capacity,
        }
    }

    /// Appends to the tail. A full queue is left untouched and the track is handed back.
    pub fn enqueue(&mut self, track: Track) -> Result<usize, Track> {
        if self.is_full() {
            return Err(track);
        }

        self.tracks.push_back(track);

        Ok(self.tracks.len())
    }

    pub fn dequeue_front(&mut self) -> Option<Track> {
        self.tracks.pop_front()
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.tracks.len();
        self.tracks.clear();
        removed
    }

    pub fn snapshot(&self) -> Vec<Track> {
        self.tracks.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tracks.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.tracks.len())
    }
}

impl Default for GuildQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::models::SourceLabel;

    pub(crate) fn track(name: &str) -> Track {
        Track {
            title: name.to_string(),
            url: format!("https://www.youtube.com/watch?v={name}"),
            requester: "tester".to_string(),
            duration: Some(std::time::Duration::from_secs(200)),
            source: SourceLabel::YouTube,
            stream_url: format!("https://media.example/{name}"),
            headers: HashMap::new(),
        }
    }

    fn titles(queue: &GuildQueue) -> Vec<String> {
        queue.snapshot().into_iter().map(|t| t.title).collect()
    }

    #[test]
    fn enqueue_rejects_past_capacity() {
        let mut queue = GuildQueue::new(3);

        for name in ["a", "b", "c"] {
            assert!(queue.enqueue(track(name)).is_ok());
        }

        let rejected = queue.enqueue(track("d")).unwrap_err();
        assert_eq!(rejected.title, "d");
        assert_eq!(queue.len(), 3);
        assert_eq!(titles(&queue), ["a", "b", "c"]);
        assert_eq!(queue.remaining(), 0);
    }

    #[test]
    fn enqueue_reports_position() {
        let mut queue = GuildQueue::default();
        assert_eq!(queue.enqueue(track("a")).ok(), Some(1));
        assert_eq!(queue.enqueue(track("b")).ok(), Some(2));
        assert_eq!(queue.capacity(), DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn fifo_order_survives_interleaving() {
        let mut queue = GuildQueue::new(4);
        queue.enqueue(track("a")).unwrap();
        queue.enqueue(track("b")).unwrap();
        queue.enqueue(track("c")).unwrap();

        assert_eq!(queue.dequeue_front().map(|t| t.title), Some("a".to_string()));
        queue.enqueue(track("d")).unwrap();
        assert_eq!(queue.dequeue_front().map(|t| t.title), Some("b".to_string()));
        queue.enqueue(track("e")).unwrap();

        assert_eq!(titles(&queue), ["c", "d", "e"]);
    }

    #[test]
    fn clear_empties_everything() {
        let mut queue = GuildQueue::new(4);
        queue.enqueue(track("a")).unwrap();
        queue.enqueue(track("b")).unwrap();

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue_front(), None);
    }

    #[test]
    fn snapshot_is_detached() {
        let mut queue = GuildQueue::new(4);
        queue.enqueue(track("a")).unwrap();

        let snapshot = queue.snapshot();
        queue.clear();

        assert_eq!(snapshot.len(), 1);
        assert!(queue.is_empty());
    }
}
