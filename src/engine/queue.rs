// Play queue with an optional shuffle view
// Storage order never changes when shuffling; the permutation only decides
// which index comes next

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::model::{MediaItem, RepeatMode};

#[derive(Debug, Clone)]
struct ShuffleView {
    /// Indices into `items` in play order.
    order: Vec<usize>,
    /// Position of the current item within `order`.
    cursor: usize,
}

#[derive(Debug, Clone)]
pub struct PlayQueue {
    items: Vec<MediaItem>,
    current: Option<usize>,
    shuffle: Option<ShuffleView>,
    seed: Option<u64>,
    /// Permutations drawn so far; offsets a pinned seed.
    draws: u64,
}

/// Old index -> new index after moving `from` to `to`.
fn moved_index(k: usize, from: usize, to: usize) -> usize {
    if k == from {
        to
    } else if from < to && k > from && k <= to {
        k - 1
    } else if to < from && k >= to && k < from {
        k + 1
    } else {
        k
    }
}

impl PlayQueue {
    /// `seed` makes the sequence of permutations reproducible across runs;
    /// `None` draws fresh entropy each time shuffle is turned on.
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            items: Vec::new(),
            current: None,
            shuffle: None,
            seed,
            draws: 0,
        }
    }

    fn next_rng(&mut self) -> StdRng {
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(self.draws)),
            None => StdRng::from_entropy(),
        };
        self.draws += 1;
        rng
    }

    pub fn items(&self) -> &[MediaItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current_item(&self) -> Option<&MediaItem> {
        self.current.and_then(|i| self.items.get(i))
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle.is_some()
    }

    pub fn shuffle_order(&self) -> Option<&[usize]> {
        self.shuffle.as_ref().map(|s| s.order.as_slice())
    }

    /// Indices still to come in play order, not counting wrap-around.
    pub fn upcoming(&self) -> Vec<usize> {
        match (&self.shuffle, self.current) {
            (Some(view), Some(_)) => view.order[view.cursor + 1..].to_vec(),
            (None, Some(current)) => (current + 1..self.items.len()).collect(),
            (_, None) => Vec::new(),
        }
    }

    pub fn set_items(&mut self, items: Vec<MediaItem>, start: usize) {
        self.current = if items.is_empty() { None } else { Some(start.min(items.len() - 1)) };
        self.items = items;
        if self.shuffle.is_some() {
            self.shuffle = None;
            self.enable_shuffle(false);
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.current = None;
        self.shuffle = None;
    }

    /// Fresh permutation. With `from_start` every item is shuffled and the
    /// first one becomes current; otherwise the current item leads.
    pub fn enable_shuffle(&mut self, from_start: bool) {
        let mut rng = self.next_rng();
        let mut order: Vec<usize> = (0..self.items.len()).collect();
        match self.current {
            Some(current) if !from_start => {
                order.retain(|&i| i != current);
                order.shuffle(&mut rng);
                order.insert(0, current);
            }
            _ => {
                order.shuffle(&mut rng);
                if !order.is_empty() {
                    self.current = Some(order[0]);
                }
            }
        }
        self.shuffle = Some(ShuffleView { order, cursor: 0 });
    }

    /// Drop the permutation; the current item keeps its natural index.
    pub fn disable_shuffle(&mut self) {
        self.shuffle = None;
    }

    /// Index that follows the current one under `repeat`, without moving.
    /// `RepeatMode::One` is treated like `All`; restarting the same item
    /// on natural end is the engine's call.
    pub fn peek_next(&self, repeat: RepeatMode) -> Option<usize> {
        let current = self.current?;
        let wrap = repeat != RepeatMode::None;
        match &self.shuffle {
            Some(view) => match view.order.get(view.cursor + 1) {
                Some(&next) => Some(next),
                None if wrap => view.order.first().copied(),
                None => None,
            },
            None if current + 1 < self.items.len() => Some(current + 1),
            None if wrap => Some(0),
            None => None,
        }
    }

    pub fn peek_previous(&self, repeat: RepeatMode) -> Option<usize> {
        let current = self.current?;
        let wrap = repeat != RepeatMode::None;
        match &self.shuffle {
            Some(view) if view.cursor > 0 => view.order.get(view.cursor - 1).copied(),
            Some(view) if wrap => view.order.last().copied(),
            Some(_) => None,
            None if current > 0 => Some(current - 1),
            None if wrap => self.items.len().checked_sub(1),
            None => None,
        }
    }

    pub fn advance(&mut self, repeat: RepeatMode) -> Option<usize> {
        let next = self.peek_next(repeat)?;
        self.jump_to(next);
        Some(next)
    }

    pub fn retreat(&mut self, repeat: RepeatMode) -> Option<usize> {
        let previous = self.peek_previous(repeat)?;
        self.jump_to(previous);
        Some(previous)
    }

    /// Make `index` current. Under shuffle the cursor follows it.
    pub fn jump_to(&mut self, index: usize) -> bool {
        if index >= self.items.len() {
            return false;
        }
        self.current = Some(index);
        if let Some(view) = self.shuffle.as_mut() {
            if let Some(pos) = view.order.iter().position(|&i| i == index) {
                view.cursor = pos;
            }
        }
        true
    }

    /// Append to storage. Under shuffle it is also appended to play order.
    pub fn enqueue(&mut self, item: MediaItem) -> usize {
        self.items.push(item);
        let index = self.items.len() - 1;
        if let Some(view) = self.shuffle.as_mut() {
            view.order.push(index);
        }
        if self.current.is_none() {
            self.jump_to(index);
        }
        index
    }

    /// Place `item` right after the current one, in storage and in play order.
    pub fn insert_next(&mut self, item: MediaItem) -> usize {
        let index = self.current.map_or(0, |c| c + 1).min(self.items.len());
        self.items.insert(index, item);
        if let Some(current) = self.current.as_mut() {
            if *current >= index {
                *current += 1;
            }
        }
        if let Some(view) = self.shuffle.as_mut() {
            for entry in view.order.iter_mut() {
                if *entry >= index {
                    *entry += 1;
                }
            }
            let at = if self.current.is_some() { view.cursor + 1 } else { 0 };
            view.order.insert(at.min(view.order.len()), index);
        }
        if self.current.is_none() {
            self.jump_to(index);
        }
        index
    }

    /// Remove `index`. If it was current, the item that would have played
    /// next becomes current (or nothing, at the end). Returns the removed
    /// item and whether it was current.
    pub fn remove_at(&mut self, index: usize) -> Option<(MediaItem, bool)> {
        if index >= self.items.len() {
            return None;
        }
        let was_current = self.current == Some(index);
        let item = self.items.remove(index);

        if let Some(view) = self.shuffle.as_mut() {
            let removed_pos = view.order.iter().position(|&i| i == index);
            view.order.retain(|&i| i != index);
            for entry in view.order.iter_mut() {
                if *entry > index {
                    *entry -= 1;
                }
            }
            if let Some(pos) = removed_pos {
                if pos < view.cursor {
                    view.cursor -= 1;
                }
            }
            self.current = if was_current {
                view.order.get(view.cursor).copied()
            } else {
                self.current.map(|c| if c > index { c - 1 } else { c })
            };
            if self.current.is_none() {
                view.cursor = 0;
            }
        } else {
            self.current = match self.current {
                Some(c) if c > index => Some(c - 1),
                Some(c) if c == index => (index < self.items.len()).then_some(index),
                other => other,
            };
        }
        Some((item, was_current))
    }

    /// Reorder storage. The current item and the shuffle view follow their
    /// items.
    pub fn move_item(&mut self, from: usize, to: usize) -> bool {
        let len = self.items.len();
        if from >= len || to >= len {
            return false;
        }
        if from == to {
            return true;
        }
        let item = self.items.remove(from);
        self.items.insert(to, item);
        self.current = self.current.map(|c| moved_index(c, from, to));
        if let Some(view) = self.shuffle.as_mut() {
            for entry in view.order.iter_mut() {
                *entry = moved_index(*entry, from, to);
            }
        }
        true
    }

    pub fn position_of(&self, song_id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.song_id == song_id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    pub(crate) fn item(id: &str) -> MediaItem {
        MediaItem {
            song_id: id.to_string(),
            file_path: PathBuf::from(format!("/music/{}.mp3", id)),
            title: id.to_string(),
            artist: "Artist".into(),
            album: "Album".into(),
            artwork: None,
            duration: Duration::from_secs(60),
        }
    }

    pub(crate) fn items(ids: &[&str]) -> Vec<MediaItem> {
        ids.iter().map(|id| item(id)).collect()
    }

    fn current_id(queue: &PlayQueue) -> Option<String> {
        queue.current_item().map(|i| i.song_id.clone())
    }

    #[test]
    fn natural_order_and_repeat() {
        let mut queue = PlayQueue::new(None);
        queue.set_items(items(&["a", "b", "c"]), 1);
        assert_eq!(queue.advance(RepeatMode::None), Some(2));
        assert_eq!(queue.advance(RepeatMode::None), None);
        assert_eq!(queue.advance(RepeatMode::All), Some(0));
        assert_eq!(queue.retreat(RepeatMode::None), None);
        assert_eq!(queue.retreat(RepeatMode::All), Some(2));
    }

    #[test]
    fn seeded_shuffle_is_reproducible_and_complete() {
        let mut a = PlayQueue::new(Some(7));
        a.set_items(items(&["a", "b", "c", "d", "e"]), 0);
        a.enable_shuffle(true);
        let mut b = PlayQueue::new(Some(7));
        b.set_items(items(&["a", "b", "c", "d", "e"]), 0);
        b.enable_shuffle(true);

        let order = a.shuffle_order().unwrap().to_vec();
        assert_eq!(order, b.shuffle_order().unwrap());
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
        assert_eq!(a.current_index(), Some(order[0]));

        let mut visited = vec![order[0]];
        while let Some(next) = a.advance(RepeatMode::None) {
            visited.push(next);
        }
        assert_eq!(visited, order);
    }

    #[test]
    fn reenabling_shuffle_draws_a_new_permutation() {
        let names = ["a", "b", "c", "d", "e", "f", "g", "h"];
        let mut queue = PlayQueue::new(Some(7));
        queue.set_items(items(&names), 0);
        queue.enable_shuffle(true);
        let first = queue.shuffle_order().unwrap().to_vec();
        queue.disable_shuffle();
        queue.enable_shuffle(true);
        let second = queue.shuffle_order().unwrap().to_vec();
        assert_ne!(first, second);

        // Same seed, same sequence of permutations
        let mut replay = PlayQueue::new(Some(7));
        replay.set_items(items(&names), 0);
        replay.enable_shuffle(true);
        assert_eq!(replay.shuffle_order().unwrap(), first.as_slice());
        replay.disable_shuffle();
        replay.enable_shuffle(true);
        assert_eq!(replay.shuffle_order().unwrap(), second.as_slice());
    }

    #[test]
    fn shuffle_keeps_current_first_and_storage_untouched() {
        let mut queue = PlayQueue::new(Some(3));
        queue.set_items(items(&["a", "b", "c", "d"]), 2);
        queue.enable_shuffle(false);
        assert_eq!(queue.shuffle_order().unwrap()[0], 2);
        let ids: Vec<&str> = queue.items().iter().map(|i| i.song_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn disabling_shuffle_returns_to_natural_order() {
        let mut queue = PlayQueue::new(Some(11));
        queue.set_items(items(&["a", "b", "c", "d", "e"]), 0);
        queue.enable_shuffle(false);
        queue.advance(RepeatMode::None);
        let here = queue.current_index().unwrap();

        queue.disable_shuffle();
        assert_eq!(queue.current_index(), Some(here));
        let expected = if here + 1 < 5 { Some(here + 1) } else { None };
        assert_eq!(queue.advance(RepeatMode::None), expected);
    }

    #[test]
    fn insert_next_under_shuffle_plays_next() {
        let mut queue = PlayQueue::new(Some(5));
        queue.set_items(items(&["a", "b", "c", "d"]), 1);
        queue.enable_shuffle(false);
        let index = queue.insert_next(item("x"));
        assert_eq!(index, 2);
        assert_eq!(current_id(&queue).as_deref(), Some("b"));
        assert_eq!(queue.advance(RepeatMode::None), Some(2));
        assert_eq!(current_id(&queue).as_deref(), Some("x"));
    }

    #[test]
    fn remove_current_moves_to_successor() {
        let mut queue = PlayQueue::new(None);
        queue.set_items(items(&["a", "b", "c"]), 1);
        let (removed, was_current) = queue.remove_at(1).unwrap();
        assert_eq!(removed.song_id, "b");
        assert!(was_current);
        assert_eq!(current_id(&queue).as_deref(), Some("c"));

        queue.remove_at(0);
        assert_eq!(current_id(&queue).as_deref(), Some("c"));
        queue.remove_at(0);
        assert_eq!(queue.current_index(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_under_shuffle_keeps_permutation_consistent() {
        let mut queue = PlayQueue::new(Some(9));
        queue.set_items(items(&["a", "b", "c", "d", "e"]), 0);
        queue.enable_shuffle(true);
        let victim = queue.shuffle_order().unwrap()[3];
        queue.remove_at(victim);

        let mut order = queue.shuffle_order().unwrap().to_vec();
        order.sort();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn move_follows_current() {
        let mut queue = PlayQueue::new(None);
        queue.set_items(items(&["a", "b", "c", "d"]), 1);
        assert!(queue.move_item(1, 3));
        assert_eq!(queue.current_index(), Some(3));
        assert_eq!(current_id(&queue).as_deref(), Some("b"));
        assert!(queue.move_item(0, 2));
        let ids: Vec<&str> = queue.items().iter().map(|i| i.song_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "a", "b"]);
        assert!(!queue.move_item(0, 9));
    }
}
