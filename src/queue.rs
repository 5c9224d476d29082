use crate::model::{AudioItem, PersistedQueue, PlaybackId};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::{IteratorRandom, SliceRandom};
use std::fmt;
use std::rc::Weak;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub enum QueueChange {
    AddedItem {
        id: PlaybackId,
        index: usize,
    },
    AddedItems {
        ids: Vec<PlaybackId>,
        index: usize,
    },
    RemovedItem {
        id: PlaybackId,
        index: usize,
    },
    RemovedAllItems {
        count: usize,
    },
    MovedItem {
        id: PlaybackId,
        from: usize,
        to: usize,
    },
    SwappedItems {
        first: PlaybackId,
        first_index: usize,
        second: PlaybackId,
        second_index: usize,
    },
    ChangedItem {
        id: PlaybackId,
        index: usize,
    },
    ReplacedAllItems {
        count: usize,
    },
}

pub trait QueueObserver {
    fn queue_changed(&self, change: &QueueChange);
}

/// Items in logical order plus a shuffle permutation over them.
///
/// `shuffled[k]` is the logical index at shuffle position `k`. The anchor is
/// the logical index of the item the owner treats as now playing; new
/// entries are always seated after it in shuffle order.
pub struct UpNextQueue {
    items: Vec<AudioItem>,
    shuffled: Vec<usize>,
    anchor: usize,
    rng: SmallRng,
    observer: Option<Weak<dyn QueueObserver>>,
}

impl fmt::Debug for UpNextQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpNextQueue")
            .field("items", &self.items.len())
            .field("shuffled", &self.shuffled)
            .field("anchor", &self.anchor)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

impl Default for UpNextQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UpNextQueue {
    pub fn new() -> Self {
        Self::with_rng(rand::make_rng::<SmallRng>())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(SmallRng::seed_from_u64(seed))
    }

    fn with_rng(rng: SmallRng) -> Self {
        Self {
            items: Vec::new(),
            shuffled: Vec::new(),
            anchor: 0,
            rng,
            observer: None,
        }
    }

    pub fn from_items(items: Vec<AudioItem>) -> Self {
        let mut queue = Self::new();
        queue.load(items);
        queue
    }

    pub fn from_persisted(persisted: PersistedQueue) -> Self {
        Self::from_items(persisted.items)
    }

    pub fn to_persisted(&self) -> PersistedQueue {
        PersistedQueue {
            items: self.items.clone(),
        }
    }

    pub fn set_observer(&mut self, observer: Weak<dyn QueueObserver>) {
        self.observer = Some(observer);
    }

    pub fn clear_observer(&mut self) {
        self.observer = None;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[AudioItem] {
        &self.items
    }

    pub fn anchor(&self) -> usize {
        self.anchor
    }

    pub fn set_anchor(&mut self, index: usize) {
        if index < self.items.len() {
            self.anchor = index;
        }
    }

    pub fn append_item(&mut self, item: AudioItem) {
        let at = self.items.len();
        self.insert_item(item, at);
    }

    pub fn append_items(&mut self, items: Vec<AudioItem>) {
        let at = self.items.len();
        self.insert_items(items, at);
    }

    pub fn prepend_item(&mut self, item: AudioItem) {
        self.insert_item(item, 0);
    }

    pub fn prepend_items(&mut self, items: Vec<AudioItem>) {
        self.insert_items(items, 0);
    }

    pub fn insert_item(&mut self, item: AudioItem, at: usize) {
        let at = at.min(self.items.len());
        let id = item.playback_id();
        self.open_gap(at, 1);
        self.items.insert(at, item);
        self.emit(QueueChange::AddedItem { id, index: at });
    }

    pub fn insert_items(&mut self, items: Vec<AudioItem>, at: usize) {
        if items.is_empty() {
            return;
        }
        let at = at.min(self.items.len());
        let ids: Vec<PlaybackId> = items.iter().map(AudioItem::playback_id).collect();
        self.open_gap(at, items.len());
        self.items.splice(at..at, items);
        self.emit(QueueChange::AddedItems { ids, index: at });
    }

    pub fn remove_item(&mut self, id: PlaybackId) -> Option<AudioItem> {
        let index = self.index_of_id(id)?;
        self.remove_item_at(index)
    }

    pub fn remove_item_at(&mut self, index: usize) -> Option<AudioItem> {
        if index >= self.items.len() {
            return None;
        }
        if let Some(pos) = self.shuffle_position_of(index) {
            self.shuffled.remove(pos);
        }
        for entry in &mut self.shuffled {
            if *entry > index {
                *entry -= 1;
            }
        }
        let removed = self.items.remove(index);
        if index < self.anchor {
            self.anchor -= 1;
        }
        self.anchor = self.anchor.min(self.items.len().saturating_sub(1));
        self.emit(QueueChange::RemovedItem {
            id: removed.playback_id(),
            index,
        });
        Some(removed)
    }

    pub fn clear(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let count = self.items.len();
        self.items.clear();
        self.shuffled.clear();
        self.anchor = 0;
        self.emit(QueueChange::RemovedAllItems { count });
    }

    pub fn replace_all(&mut self, items: Vec<AudioItem>) {
        self.load(items);
        let count = self.items.len();
        self.emit(QueueChange::ReplacedAllItems { count });
    }

    pub fn move_item(&mut self, id: PlaybackId, to: usize) -> bool {
        match self.index_of_id(id) {
            Some(from) => self.move_item_at(from, to),
            None => false,
        }
    }

    pub fn move_item_at(&mut self, from: usize, to: usize) -> bool {
        let len = self.items.len();
        if from >= len {
            return false;
        }
        let to = to.min(len - 1);
        if from == to {
            return false;
        }

        let remap = |index: usize| {
            if index == from {
                to
            } else if from < to && index > from && index <= to {
                index - 1
            } else if to < from && index >= to && index < from {
                index + 1
            } else {
                index
            }
        };
        for entry in &mut self.shuffled {
            *entry = remap(*entry);
        }
        let moved_anchor = self.anchor == from;
        self.anchor = remap(self.anchor);

        if !moved_anchor {
            if let Some(pos) = self.shuffle_position_of(to) {
                self.shuffled.remove(pos);
            }
            let seat = self.random_seat_after_anchor();
            self.shuffled.insert(seat, to);
        }

        let item = self.items.remove(from);
        let id = item.playback_id();
        self.items.insert(to, item);
        self.emit(QueueChange::MovedItem { id, from, to });
        true
    }

    pub fn swap_items(&mut self, a: usize, b: usize) -> bool {
        let len = self.items.len();
        if a >= len || b >= len || a == b {
            return false;
        }
        self.items.swap(a, b);
        for entry in &mut self.shuffled {
            if *entry == a {
                *entry = b;
            } else if *entry == b {
                *entry = a;
            }
        }
        if self.anchor == a {
            self.anchor = b;
        } else if self.anchor == b {
            self.anchor = a;
        }
        self.emit(QueueChange::SwappedItems {
            first: self.items[b].playback_id(),
            first_index: a,
            second: self.items[a].playback_id(),
            second_index: b,
        });
        true
    }

    pub fn refresh_item(&mut self, updated: AudioItem) -> Option<usize> {
        let index = self.index_of_id(updated.playback_id())?;
        let id = updated.playback_id();
        self.items[index] = updated;
        self.emit(QueueChange::ChangedItem { id, index });
        Some(index)
    }

    pub fn shuffle_starting_at(&mut self, start: usize) {
        if self.shuffled.len() <= 1 || start >= self.shuffled.len() {
            return;
        }
        self.shuffled[start..].shuffle(&mut self.rng);
    }

    pub fn reshuffle(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let anchor = self.anchor;
        self.shuffled.clear();
        self.shuffled.push(anchor);
        self.shuffled
            .extend((0..self.items.len()).filter(|&index| index != anchor));
        self.shuffle_starting_at(1);
    }

    pub fn get(&self, index: usize) -> Option<&AudioItem> {
        self.items.get(index)
    }

    pub fn unshuffled_item_at(&self, index: usize) -> Option<&AudioItem> {
        self.get(index)
    }

    pub fn shuffled_item_at(&self, position: usize) -> Option<&AudioItem> {
        self.logical_index_at(position)
            .and_then(|index| self.items.get(index))
    }

    pub fn item_for_id(&self, id: PlaybackId) -> Option<&AudioItem> {
        self.items.iter().find(|item| item.playback_id() == id)
    }

    pub fn index_of_id(&self, id: PlaybackId) -> Option<usize> {
        self.items.iter().position(|item| item.playback_id() == id)
    }

    pub fn index_of_url(&self, url: &Url) -> Option<usize> {
        self.items.iter().position(|item| &item.playback_url == url)
    }

    pub fn proper_position_for_id(&self, id: PlaybackId, shuffle: bool) -> Option<usize> {
        let index = self.index_of_id(id)?;
        if shuffle {
            self.shuffle_position_of(index)
        } else {
            Some(index)
        }
    }

    pub fn shuffle_position_of(&self, logical: usize) -> Option<usize> {
        self.shuffled.iter().position(|&entry| entry == logical)
    }

    pub fn logical_index_at(&self, position: usize) -> Option<usize> {
        self.shuffled.get(position).copied()
    }

    pub fn shuffle_order(&self) -> &[usize] {
        &self.shuffled
    }

    pub fn proper_queue(&self, shuffle: bool) -> Vec<&AudioItem> {
        if shuffle {
            self.shuffled
                .iter()
                .filter_map(|&index| self.items.get(index))
                .collect()
        } else {
            self.items.iter().collect()
        }
    }

    fn load(&mut self, items: Vec<AudioItem>) {
        self.items = items;
        self.anchor = 0;
        self.shuffled = (0..self.items.len()).collect();
        self.shuffle_starting_at(1);
    }

    // Shifts logical indices at or after `at` up by `count` and seats the new
    // indices after the anchor. Called before the items themselves land.
    fn open_gap(&mut self, at: usize, count: usize) {
        let was_empty = self.items.is_empty();
        for entry in &mut self.shuffled {
            if *entry >= at {
                *entry += count;
            }
        }
        if was_empty {
            self.anchor = 0;
        } else if at <= self.anchor {
            self.anchor += count;
        }
        for offset in 0..count {
            let seat = if was_empty && offset == 0 {
                0
            } else {
                self.random_seat_after_anchor()
            };
            self.shuffled.insert(seat, at + offset);
        }
    }

    fn random_seat_after_anchor(&mut self) -> usize {
        let len = self.shuffled.len();
        let first = self
            .shuffle_position_of(self.anchor)
            .map(|pos| pos + 1)
            .unwrap_or(0)
            .min(len);
        (first..=len).choose(&mut self.rng).unwrap_or(len)
    }

    fn emit(&self, change: QueueChange) {
        if let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) {
            observer.queue_changed(&change);
        }
    }
}
