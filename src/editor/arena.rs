//! Index-stable slot map for instances registered with the editor engine.
//!
//! Keys carry a generation so a stale key held across a removal can never
//! reach the entry that later reuses its index.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant,
}

pub struct SlotArena<T> {
    entries: Vec<Entry<T>>,
    /// Vacant indices with the generation their next occupant gets.
    free: Vec<(u32, u32)>,
    len: usize,
}

impl<T> Default for SlotArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotArena<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> SlotKey {
        self.len += 1;
        if let Some((index, generation)) = self.free.pop() {
            self.entries[index as usize] = Entry::Occupied { generation, value };
            return SlotKey { index, generation };
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry::Occupied {
            generation: 0,
            value,
        });
        SlotKey {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, key: SlotKey) -> Option<&T> {
        match self.entries.get(key.index as usize)? {
            Entry::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: SlotKey) -> Option<T> {
        let entry = self.entries.get_mut(key.index as usize)?;
        match entry {
            Entry::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }
        let old = std::mem::replace(entry, Entry::Vacant);
        self.free
            .push((key.index, key.generation.wrapping_add(1)));
        self.len -= 1;
        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotKey, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } => Some((
                    SlotKey {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Entry::Vacant => None,
            })
    }

    /// Remove and return every value.
    pub fn drain(&mut self) -> Vec<T> {
        let entries = std::mem::take(&mut self.entries);
        self.free.clear();
        self.len = 0;
        entries
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Occupied { value, .. } => Some(value),
                Entry::Vacant => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_key_misses_after_reuse() {
        let mut arena = SlotArena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.remove(a), None);

        let c = arena.insert("c");
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(c), Some(&"c"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn iter_skips_removed_slots() {
        let mut arena = SlotArena::new();
        let keys: Vec<_> = (0..4).map(|i| arena.insert(i)).collect();
        arena.remove(keys[1]);
        let live: Vec<_> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, vec![0, 2, 3]);
        assert_eq!(arena.len(), 3);

        assert_eq!(arena.drain(), vec![0, 2, 3]);
        assert!(arena.is_empty());
    }
}
