// In-memory view stores: master record, seat table, character detail cache.
//
// All three are transient and rebuilt from the push channel on every session.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;

use crate::protocol::{Character, CharacterId, MasterRecord, PlayerEntry};

// ---------------------------------------------------------------------------
// Master record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterStore {
    current: Option<MasterRecord>,
}

impl MasterStore {
    pub fn get(&self) -> Option<&MasterRecord> {
        self.current.as_ref()
    }

    /// Replace the record wholesale. Returns `false` when the new record is
    /// equal to the cached one.
    pub fn replace(&mut self, record: MasterRecord) -> bool {
        if self.current.as_ref() == Some(&record) {
            return false;
        }
        self.current = Some(record);
        true
    }

    /// Install `fallback` only if no master is known yet.
    pub fn ensure_with(&mut self, fallback: impl FnOnce() -> MasterRecord) -> bool {
        if self.current.is_some() {
            return false;
        }
        self.current = Some(fallback());
        true
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

// ---------------------------------------------------------------------------
// Seat table
// ---------------------------------------------------------------------------

/// Fixed-length table of non-master seats. Its length never changes after
/// construction, whatever the server reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTable {
    slots: Vec<Option<PlayerEntry>>,
}

impl SlotTable {
    pub fn new(len: usize) -> Self {
        SlotTable {
            slots: vec![None; len],
        }
    }

    /// Rebuild from a server-reported seat list, padding with vacant seats or
    /// truncating to the table length. Returns whether any seat changed.
    pub fn rebuild(&mut self, mut players: Vec<Option<PlayerEntry>>) -> bool {
        let len = self.slots.len();
        players.truncate(len);
        players.resize(len, None);
        if players == self.slots {
            return false;
        }
        self.slots = players;
        true
    }

    pub fn slots(&self) -> &[Option<PlayerEntry>] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

// ---------------------------------------------------------------------------
// Character detail cache
// ---------------------------------------------------------------------------

struct CacheInner {
    entries: HashMap<CharacterId, Arc<Character>>,
    revision: u64,
}

/// Shared character-detail cache.
///
/// Cloning yields another handle to the same map. The reconciler and the
/// action dispatcher both write through [`CharacterCache::upsert`], which
/// replaces an entry only when the new document differs by value, so writes
/// from either side commute.
#[derive(Clone)]
pub struct CharacterCache {
    inner: Arc<RwLock<CacheInner>>,
    revisions: Arc<watch::Sender<u64>>,
}

impl Default for CharacterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CharacterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharacterCache")
            .field("len", &self.len())
            .field("revision", &self.revision())
            .finish()
    }
}

impl CharacterCache {
    pub fn new() -> Self {
        let (revisions, _) = watch::channel(0);
        CharacterCache {
            inner: Arc::new(RwLock::new(CacheInner {
                entries: HashMap::new(),
                revision: 0,
            })),
            revisions: Arc::new(revisions),
        }
    }

    /// Insert or replace the entry for `character.id`. An equal document is
    /// a no-op and keeps the existing `Arc`. Returns whether the cache changed.
    pub fn upsert(&self, character: Character) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner
            .entries
            .get(&character.id)
            .is_some_and(|cached| **cached == character)
        {
            return false;
        }
        inner.entries.insert(character.id, Arc::new(character));
        inner.revision += 1;
        // Published under the lock so watchers never observe a revision regress.
        self.revisions.send_replace(inner.revision);
        true
    }

    /// Upsert every document, returning how many entries actually changed.
    pub fn upsert_all(&self, characters: impl IntoIterator<Item = Character>) -> usize {
        characters
            .into_iter()
            .map(|c| self.upsert(c))
            .filter(|changed| *changed)
            .count()
    }

    pub fn get(&self, id: CharacterId) -> Option<Arc<Character>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: CharacterId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains_key(&id)
    }

    /// Cached ids in ascending order.
    pub fn ids(&self) -> Vec<CharacterId> {
        let mut ids: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter that advances once per real mutation.
    pub fn revision(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .revision
    }

    /// Watch the revision counter, e.g. to republish a view after an
    /// optimistic merge made outside the session loop.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revisions.subscribe()
    }

    /// Whether both handles point at the same map.
    pub fn same_cache(&self, other: &CharacterCache) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.entries.is_empty() {
            return;
        }
        inner.entries.clear();
        inner.revision += 1;
        self.revisions.send_replace(inner.revision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(name: &str, id: i64) -> Option<PlayerEntry> {
        Some(PlayerEntry {
            username: name.into(),
            character_id: CharacterId(id),
        })
    }

    fn character(id: i64, name: &str, hp: i64) -> Character {
        let mut c = Character::new(CharacterId(id), name);
        c.current_hp = hp;
        c
    }

    #[test]
    fn short_roster_is_padded() {
        let mut table = SlotTable::new(3);
        assert!(table.rebuild(vec![player("Bob", 12)]));
        assert_eq!(table.slots(), &[player("Bob", 12), None, None]);
    }

    #[test]
    fn long_roster_is_truncated() {
        let mut table = SlotTable::new(2);
        table.rebuild(vec![player("Bob", 1), player("Cy", 2), player("Di", 3)]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.slots(), &[player("Bob", 1), player("Cy", 2)]);
    }

    #[test]
    fn empty_roster_keeps_length() {
        let mut table = SlotTable::new(3);
        table.rebuild(vec![player("Bob", 1)]);
        assert!(table.rebuild(vec![]));
        assert_eq!(table.slots(), &[None, None, None]);
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn roster_length_is_invariant_for_any_input() {
        for len in 0..5 {
            for reported in 0..8 {
                let mut table = SlotTable::new(len);
                let players = (0..reported).map(|i| player("p", i as i64)).collect();
                table.rebuild(players);
                assert_eq!(table.len(), len);
            }
        }
    }

    #[test]
    fn identical_roster_reports_no_change() {
        let mut table = SlotTable::new(3);
        table.rebuild(vec![player("Bob", 12)]);
        assert!(!table.rebuild(vec![player("Bob", 12), None]));
    }

    #[test]
    fn master_replace_is_value_gated() {
        let mut store = MasterStore::default();
        let alice = MasterRecord {
            username: "Alice".into(),
            character_id: None,
        };
        assert!(store.replace(alice.clone()));
        assert!(!store.replace(alice));
        assert!(!store.ensure_with(|| unreachable!()));
    }

    #[test]
    fn equal_upsert_keeps_cached_arc() {
        let cache = CharacterCache::new();
        assert!(cache.upsert(character(1, "Mira", 10)));
        let before = cache.get(CharacterId(1)).unwrap();

        assert!(!cache.upsert(character(1, "Mira", 10)));
        let after = cache.get(CharacterId(1)).unwrap();

        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(cache.revision(), 1);
    }

    #[test]
    fn differing_upsert_replaces_entry() {
        let cache = CharacterCache::new();
        cache.upsert(character(1, "Mira", 10));
        let before = cache.get(CharacterId(1)).unwrap();

        assert!(cache.upsert(character(1, "Mira", 4)));
        let after = cache.get(CharacterId(1)).unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.current_hp, 4);
    }

    #[test]
    fn clones_share_entries() {
        let cache = CharacterCache::new();
        let other = cache.clone();
        other.upsert(character(5, "Tam", 1));
        assert!(cache.contains(CharacterId(5)));
        assert!(cache.same_cache(&other));
        assert!(!cache.same_cache(&CharacterCache::new()));
    }

    #[test]
    fn upsert_all_counts_changes() {
        let cache = CharacterCache::new();
        let batch = vec![character(1, "A", 1), character(2, "B", 2)];
        assert_eq!(cache.upsert_all(batch.clone()), 2);
        assert_eq!(cache.upsert_all(batch), 0);
        assert_eq!(cache.ids(), vec![CharacterId(1), CharacterId(2)]);
    }

    #[test]
    fn subscribers_see_revisions() {
        let cache = CharacterCache::new();
        let rx = cache.subscribe();
        cache.upsert(character(1, "A", 1));
        assert_eq!(*rx.borrow(), 1);
        cache.clear();
        assert_eq!(*rx.borrow(), 2);
        assert!(cache.is_empty());
    }
}
