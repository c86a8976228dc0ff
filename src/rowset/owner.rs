//! Row-set memory owner - the single allocation authority for one
//! query's execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::PinnedBuffer;
use crate::common::config::ARENA_MIN_ALLOC;
use crate::common::MemoryLevel;
use crate::rowset::{Arena, ArenaBuf, DictId, StringDictionary, StringDictionaryProxy, TranslationMap};

/// Which translation map variant to build between two proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringTranslationType {
    /// Source ids missing from the destination stay untranslated.
    SourceIntersection,
    /// Source ids missing from the destination are added to it.
    SourceUnion,
}

struct OwnerState {
    arena: Arena,
    /// Registered count-distinct bitmap sizes (the regions themselves
    /// live in the arena).
    count_distinct_buffer_sizes: Vec<usize>,
    count_distinct_sets: Vec<HashSet<i64>>,
    group_by_buffers: Vec<Vec<i64>>,
    varlen_buffers: Vec<Vec<u8>>,
    /// Pinned GPU input buffers; the pins release when the owner drops.
    varlen_input_buffers: Vec<PinnedBuffer>,
    strings: Vec<String>,
    arrays: Vec<Vec<i64>>,
    str_dict_proxies: HashMap<DictId, Arc<StringDictionaryProxy>>,
    intersection_maps: HashMap<(DictId, DictId), Arc<TranslationMap>>,
    union_maps: HashMap<(DictId, DictId), Arc<TranslationMap>>,
    col_buffers: Vec<Vec<u8>>,
}

/// Handles allocations and outputs for all stages of one query, shared
/// across its worker threads.
///
/// Every mutating method serializes behind one mutex. That is
/// intentionally coarse: per-query scratch allocation is not a
/// bottleneck, arena allocation cost dominates contention.
///
/// Dropping the owner is the single teardown path and runs exactly
/// once: it frees the arena with every region carved from it, every
/// tracked set and buffer, and unpins every GPU input buffer — on every
/// exit path, including a query cancelled mid-execution.
pub struct RowSetMemoryOwner {
    state: Mutex<OwnerState>,
    arena_block_bytes: usize,
}

impl RowSetMemoryOwner {
    pub fn new(arena_block_bytes: usize) -> Self {
        Self {
            state: Mutex::new(OwnerState {
                arena: Arena::new(arena_block_bytes),
                count_distinct_buffer_sizes: Vec::new(),
                count_distinct_sets: Vec::new(),
                group_by_buffers: Vec::new(),
                varlen_buffers: Vec::new(),
                varlen_input_buffers: Vec::new(),
                strings: Vec::new(),
                arrays: Vec::new(),
                str_dict_proxies: HashMap::new(),
                intersection_maps: HashMap::new(),
                union_maps: HashMap::new(),
                col_buffers: Vec::new(),
            }),
            arena_block_bytes,
        }
    }

    pub fn arena_block_bytes(&self) -> usize {
        self.arena_block_bytes
    }

    /// Total bytes carved from the arena so far.
    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().arena.allocated_bytes()
    }

    // ========================================================================
    // Arena allocations
    // ========================================================================

    /// Carve a zeroed scratch region of at least `num_bytes`.
    ///
    /// Requests round up to [`ARENA_MIN_ALLOC`] so buffers handed to
    /// different worker threads never share a cache line; the returned
    /// region reports the rounded length.
    pub fn allocate(&self, num_bytes: usize) -> ArenaBuf<'_> {
        let rounded = num_bytes.max(ARENA_MIN_ALLOC);
        let mut state = self.state.lock();
        let ptr = state.arena.allocate(rounded);
        ArenaBuf::new(ptr, rounded)
    }

    /// Carve and register a zeroed count-distinct bitmap.
    pub fn allocate_count_distinct_buffer(&self, num_bytes: usize) -> ArenaBuf<'_> {
        let rounded = num_bytes.max(ARENA_MIN_ALLOC);
        let mut state = self.state.lock();
        let ptr = state.arena.allocate(rounded);
        state.count_distinct_buffer_sizes.push(num_bytes);
        ArenaBuf::new(ptr, rounded)
    }

    // ========================================================================
    // Tracked outputs
    // ========================================================================

    /// Take ownership of a count-distinct set.
    pub fn add_count_distinct_set(&self, set: HashSet<i64>) {
        self.state.lock().count_distinct_sets.push(set);
    }

    /// Take ownership of a group-by output buffer.
    pub fn add_group_by_buffer(&self, buffer: Vec<i64>) {
        self.state.lock().group_by_buffers.push(buffer);
    }

    /// Take ownership of a variable-length output buffer.
    pub fn add_varlen_buffer(&self, buffer: Vec<u8>) {
        self.state.lock().varlen_buffers.push(buffer);
    }

    /// Hold a pinned GPU buffer containing a variable-length input
    /// column. Such buffers are referenced by projected targets and must
    /// not be evicted until the query results have been resolved; the
    /// pin releases when this owner drops.
    ///
    /// # Panics
    /// Panics if the buffer is not GPU resident — pinning a host buffer
    /// here is a lifetime bug in the calling layer.
    pub fn add_varlen_input_buffer(&self, buffer: PinnedBuffer) {
        assert_eq!(
            buffer.level(),
            MemoryLevel::Gpu,
            "varlen input buffers must be GPU resident"
        );
        self.state.lock().varlen_input_buffers.push(buffer);
    }

    /// Take ownership of a string.
    pub fn add_string(&self, s: String) {
        self.state.lock().strings.push(s);
    }

    /// Take ownership of an array literal.
    pub fn add_array(&self, arr: Vec<i64>) {
        self.state.lock().arrays.push(arr);
    }

    /// Take ownership of a materialized column buffer.
    pub fn add_col_buffer(&self, buffer: Vec<u8>) {
        self.state.lock().col_buffers.push(buffer);
    }

    // ========================================================================
    // String dictionary proxies
    // ========================================================================

    /// The proxy for `dict`, created on first use and cached by
    /// dictionary id. On reuse the proxy's generation advances
    /// idempotently.
    ///
    /// # Panics
    /// Panics if `dict.dict_id()` was previously bound to a different
    /// dictionary object.
    pub fn add_string_dict(
        &self,
        dict: &Arc<StringDictionary>,
        generation: i64,
    ) -> Arc<StringDictionaryProxy> {
        let mut state = self.state.lock();
        if let Some(proxy) = state.str_dict_proxies.get(&dict.dict_id()) {
            assert!(
                Arc::ptr_eq(proxy.dictionary(), dict),
                "dictionary id rebound to a different dictionary"
            );
            proxy.update_generation(generation);
            return Arc::clone(proxy);
        }
        debug!(dict_id = dict.dict_id().0, generation, "created dictionary proxy");
        let proxy = Arc::new(StringDictionaryProxy::new(Arc::clone(dict), generation));
        state
            .str_dict_proxies
            .insert(dict.dict_id(), Arc::clone(&proxy));
        proxy
    }

    /// The cached proxy for a dictionary id, if one was created.
    pub fn get_string_dict_proxy(&self, dict_id: DictId) -> Option<Arc<StringDictionaryProxy>> {
        self.state.lock().str_dict_proxies.get(&dict_id).cloned()
    }

    /// The translation map from `source` to `dest`, computed once per
    /// (source, dest, variant) and cached.
    pub fn add_string_proxy_translation_map(
        &self,
        source: &Arc<StringDictionaryProxy>,
        dest: &Arc<StringDictionaryProxy>,
        translation_type: StringTranslationType,
    ) -> Arc<TranslationMap> {
        let key = (source.dict_id(), dest.dict_id());
        let mut state = self.state.lock();
        let maps = match translation_type {
            StringTranslationType::SourceIntersection => &mut state.intersection_maps,
            StringTranslationType::SourceUnion => &mut state.union_maps,
        };
        if let Some(map) = maps.get(&key) {
            return Arc::clone(map);
        }
        let map = Arc::new(match translation_type {
            StringTranslationType::SourceIntersection => {
                source.build_intersection_translation_map(dest)
            }
            StringTranslationType::SourceUnion => source.build_union_translation_map(dest),
        });
        maps.insert(key, Arc::clone(&map));
        map
    }

    /// Intersection translation map accessor.
    pub fn add_string_proxy_intersection_translation_map(
        &self,
        source: &Arc<StringDictionaryProxy>,
        dest: &Arc<StringDictionaryProxy>,
    ) -> Arc<TranslationMap> {
        self.add_string_proxy_translation_map(source, dest, StringTranslationType::SourceIntersection)
    }

    /// Union translation map accessor.
    pub fn add_string_proxy_union_translation_map(
        &self,
        source: &Arc<StringDictionaryProxy>,
        dest: &Arc<StringDictionaryProxy>,
    ) -> Arc<TranslationMap> {
        self.add_string_proxy_translation_map(source, dest, StringTranslationType::SourceUnion)
    }

    /// Number of GPU input buffers currently held.
    pub fn varlen_input_buffer_count(&self) -> usize {
        self.state.lock().varlen_input_buffers.len()
    }
}

impl std::fmt::Debug for RowSetMemoryOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RowSetMemoryOwner")
            .field("arena", &state.arena)
            .field("count_distinct_sets", &state.count_distinct_sets.len())
            .field("group_by_buffers", &state.group_by_buffers.len())
            .field("str_dict_proxies", &state.str_dict_proxies.len())
            .field("varlen_input_buffers", &state.varlen_input_buffers.len())
            .finish()
    }
}
