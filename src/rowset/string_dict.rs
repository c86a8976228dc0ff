//! String dictionaries, per-query proxies and id translation maps.
//!
//! The dictionary service itself belongs to the catalog layer; the
//! concrete [`StringDictionary`] here is the minimal append-only form
//! the proxies need. A [`StringDictionaryProxy`] is a per-query overlay:
//! a generation-bounded view of the shared dictionary plus transient
//! strings the query added, carried at negative ids.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Id of a dictionary-encoded string.
pub type StringId = i32;

/// Returned when a string has no id in the target dictionary.
pub const INVALID_STRING_ID: StringId = -1;

/// Transient ids count down from -2; -1 stays reserved for "invalid".
fn transient_id(index: usize) -> StringId {
    -(index as StringId) - 2
}

fn transient_index(id: StringId) -> usize {
    (-id - 2) as usize
}

/// Identity of one dictionary within the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DictId(pub i32);

struct DictState {
    strings: Vec<String>,
    index: HashMap<String, StringId>,
}

/// Shared append-only string dictionary.
pub struct StringDictionary {
    id: DictId,
    state: RwLock<DictState>,
}

impl StringDictionary {
    pub fn new(id: DictId) -> Self {
        Self {
            id,
            state: RwLock::new(DictState {
                strings: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    #[inline]
    pub fn dict_id(&self) -> DictId {
        self.id
    }

    /// Id of `s`, adding it if absent.
    pub fn get_or_add(&self, s: &str) -> StringId {
        {
            let state = self.state.read();
            if let Some(&id) = state.index.get(s) {
                return id;
            }
        }
        let mut state = self.state.write();
        if let Some(&id) = state.index.get(s) {
            return id;
        }
        let id = state.strings.len() as StringId;
        state.strings.push(s.to_owned());
        state.index.insert(s.to_owned(), id);
        id
    }

    pub fn id_of(&self, s: &str) -> Option<StringId> {
        self.state.read().index.get(s).copied()
    }

    pub fn string(&self, id: StringId) -> Option<String> {
        if id < 0 {
            return None;
        }
        self.state.read().strings.get(id as usize).cloned()
    }

    /// Number of entries; the generation basis for new proxies.
    pub fn size(&self) -> usize {
        self.state.read().strings.len()
    }
}

struct ProxyState {
    /// How many persisted entries this query may see.
    generation: i64,
    transient: Vec<String>,
    transient_index: HashMap<String, StringId>,
}

/// Per-query overlay over one shared dictionary.
pub struct StringDictionaryProxy {
    dict: Arc<StringDictionary>,
    state: Mutex<ProxyState>,
}

impl StringDictionaryProxy {
    /// A `generation < 0` snapshots the dictionary's current size.
    pub fn new(dict: Arc<StringDictionary>, generation: i64) -> Self {
        let generation = if generation < 0 {
            dict.size() as i64
        } else {
            generation
        };
        Self {
            dict,
            state: Mutex::new(ProxyState {
                generation,
                transient: Vec::new(),
                transient_index: HashMap::new(),
            }),
        }
    }

    #[inline]
    pub fn dict_id(&self) -> DictId {
        self.dict.dict_id()
    }

    #[inline]
    pub fn dictionary(&self) -> &Arc<StringDictionary> {
        &self.dict
    }

    pub fn generation(&self) -> i64 {
        self.state.lock().generation
    }

    /// Advance the visible generation. Idempotent: never lowers it, and
    /// a negative generation is a no-op.
    pub fn update_generation(&self, generation: i64) {
        if generation < 0 {
            return;
        }
        let mut state = self.state.lock();
        if generation > state.generation {
            state.generation = generation;
        }
    }

    pub fn transient_count(&self) -> usize {
        self.state.lock().transient.len()
    }

    /// Id of `s` in this proxy's view, or [`INVALID_STRING_ID`].
    pub fn id_of(&self, s: &str) -> StringId {
        let state = self.state.lock();
        if let Some(id) = self.dict.id_of(s) {
            if (id as i64) < state.generation {
                return id;
            }
        }
        state
            .transient_index
            .get(s)
            .copied()
            .unwrap_or(INVALID_STRING_ID)
    }

    /// Id of `s`, adding a transient entry if the base dictionary does
    /// not hold it within this proxy's generation.
    pub fn get_or_add_transient(&self, s: &str) -> StringId {
        let mut state = self.state.lock();
        if let Some(id) = self.dict.id_of(s) {
            if (id as i64) < state.generation {
                return id;
            }
        }
        if let Some(&id) = state.transient_index.get(s) {
            return id;
        }
        let id = transient_id(state.transient.len());
        state.transient.push(s.to_owned());
        state.transient_index.insert(s.to_owned(), id);
        id
    }

    pub fn string(&self, id: StringId) -> Option<String> {
        if id <= -2 {
            let state = self.state.lock();
            return state.transient.get(transient_index(id)).cloned();
        }
        if id < 0 {
            return None;
        }
        let state = self.state.lock();
        if (id as i64) < state.generation {
            self.dict.string(id)
        } else {
            None
        }
    }

    /// All visible entries plus the domain shape: transients first (ids
    /// -2 downward), then persisted ids `[0, generation)`.
    fn entries(&self) -> (Vec<(StringId, String)>, usize, usize) {
        let state = self.state.lock();
        let num_transients = state.transient.len();
        let generation = state.generation as usize;
        let mut out = Vec::with_capacity(num_transients + generation);
        for (i, s) in state.transient.iter().enumerate() {
            out.push((transient_id(i), s.clone()));
        }
        for id in 0..state.generation {
            if let Some(s) = self.dict.string(id as StringId) {
                out.push((id as StringId, s));
            }
        }
        (out, num_transients, generation)
    }

    /// Map every id of this proxy to `dest`'s id for the same string,
    /// [`INVALID_STRING_ID`] where `dest` has none.
    pub fn build_intersection_translation_map(
        &self,
        dest: &StringDictionaryProxy,
    ) -> TranslationMap {
        self.build_translation_map(dest, false)
    }

    /// Like the intersection map, but strings missing from `dest` are
    /// added to it as transients, so every id translates.
    pub fn build_union_translation_map(&self, dest: &StringDictionaryProxy) -> TranslationMap {
        self.build_translation_map(dest, true)
    }

    fn build_translation_map(&self, dest: &StringDictionaryProxy, add_missing: bool) -> TranslationMap {
        // Snapshot the source before touching dest: the two proxies may
        // be the same object.
        let (entries, num_transients, generation) = self.entries();
        let mut ids = vec![INVALID_STRING_ID; num_transients + generation];
        for (id, s) in entries {
            let index = if id <= -2 {
                transient_index(id)
            } else {
                num_transients + id as usize
            };
            ids[index] = if add_missing {
                dest.get_or_add_transient(&s)
            } else {
                dest.id_of(&s)
            };
        }
        TranslationMap {
            ids,
            num_transients,
        }
    }
}

/// Dense id translation table between two dictionary proxies.
///
/// The domain covers the source proxy's transient ids (-2 downward)
/// followed by its persisted ids `[0, generation)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationMap {
    ids: Vec<StringId>,
    num_transients: usize,
}

impl TranslationMap {
    /// Number of source ids covered.
    pub fn domain_size(&self) -> usize {
        self.ids.len()
    }

    /// Translate one source id; [`INVALID_STRING_ID`] if out of domain
    /// or unmapped.
    pub fn translate(&self, id: StringId) -> StringId {
        let index = if id <= -2 {
            transient_index(id)
        } else if id >= 0 {
            self.num_transients + id as usize
        } else {
            return INVALID_STRING_ID;
        };
        self.ids.get(index).copied().unwrap_or(INVALID_STRING_ID)
    }

    /// How many source ids have no destination id.
    pub fn num_untranslated(&self) -> usize {
        self.ids.iter().filter(|&&id| id == INVALID_STRING_ID).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict_with(words: &[&str]) -> Arc<StringDictionary> {
        let dict = Arc::new(StringDictionary::new(DictId(1)));
        for w in words {
            dict.get_or_add(w);
        }
        dict
    }

    #[test]
    fn test_dictionary_get_or_add() {
        let dict = StringDictionary::new(DictId(1));
        assert_eq!(dict.get_or_add("a"), 0);
        assert_eq!(dict.get_or_add("b"), 1);
        assert_eq!(dict.get_or_add("a"), 0);
        assert_eq!(dict.size(), 2);
        assert_eq!(dict.string(1).as_deref(), Some("b"));
        assert_eq!(dict.id_of("c"), None);
    }

    #[test]
    fn test_proxy_generation_bounds_view() {
        let dict = dict_with(&["a", "b", "c"]);
        let proxy = StringDictionaryProxy::new(Arc::clone(&dict), 2);

        assert_eq!(proxy.id_of("a"), 0);
        assert_eq!(proxy.id_of("b"), 1);
        // "c" exists in the base dictionary but past the generation.
        assert_eq!(proxy.id_of("c"), INVALID_STRING_ID);
        assert_eq!(proxy.string(2), None);

        proxy.update_generation(3);
        assert_eq!(proxy.id_of("c"), 2);
        // Generations never move backwards.
        proxy.update_generation(1);
        assert_eq!(proxy.generation(), 3);
    }

    #[test]
    fn test_transient_ids_count_down_from_minus_two() {
        let dict = dict_with(&["a"]);
        let proxy = StringDictionaryProxy::new(dict, -1);

        assert_eq!(proxy.get_or_add_transient("x"), -2);
        assert_eq!(proxy.get_or_add_transient("y"), -3);
        assert_eq!(proxy.get_or_add_transient("x"), -2);
        // Strings already visible in the base stay at their base id.
        assert_eq!(proxy.get_or_add_transient("a"), 0);

        assert_eq!(proxy.string(-2).as_deref(), Some("x"));
        assert_eq!(proxy.string(-3).as_deref(), Some("y"));
        assert_eq!(proxy.transient_count(), 2);
    }

    #[test]
    fn test_intersection_translation_map() {
        let source_dict = dict_with(&["a", "b", "c"]);
        let dest_dict = Arc::new(StringDictionary::new(DictId(2)));
        dest_dict.get_or_add("c");
        dest_dict.get_or_add("a");

        let source = StringDictionaryProxy::new(source_dict, -1);
        let dest = StringDictionaryProxy::new(dest_dict, -1);
        source.get_or_add_transient("t");

        let map = source.build_intersection_translation_map(&dest);
        assert_eq!(map.domain_size(), 4);
        assert_eq!(map.translate(0), 1); // "a"
        assert_eq!(map.translate(1), INVALID_STRING_ID); // "b"
        assert_eq!(map.translate(2), 0); // "c"
        assert_eq!(map.translate(-2), INVALID_STRING_ID); // "t"
        assert_eq!(map.num_untranslated(), 2);
    }

    #[test]
    fn test_union_translation_map_adds_missing() {
        let source_dict = dict_with(&["a", "b"]);
        let dest_dict = Arc::new(StringDictionary::new(DictId(2)));
        dest_dict.get_or_add("b");

        let source = StringDictionaryProxy::new(source_dict, -1);
        let dest = StringDictionaryProxy::new(dest_dict, -1);

        let map = source.build_union_translation_map(&dest);
        assert_eq!(map.num_untranslated(), 0);
        assert_eq!(map.translate(1), 0); // "b" persisted in dest
        assert_eq!(map.translate(0), -2); // "a" became a dest transient
        assert_eq!(dest.string(-2).as_deref(), Some("a"));
    }

    #[test]
    fn test_translate_out_of_domain() {
        let source = StringDictionaryProxy::new(dict_with(&["a"]), -1);
        let dest = StringDictionaryProxy::new(dict_with(&["a"]), -1);
        let map = source.build_intersection_translation_map(&dest);
        assert_eq!(map.translate(99), INVALID_STRING_ID);
        assert_eq!(map.translate(INVALID_STRING_ID), INVALID_STRING_ID);
    }
}
