//! Per-query memory ownership.
//!
//! One [`RowSetMemoryOwner`] exists per query execution and is shared
//! across its worker threads. It centralizes every transient allocation
//! the execution needs — group-by buffers, count-distinct structures,
//! dictionary proxies, varlen scratch — independent of the chunk cache,
//! and releases everything atomically when the query's results are
//! consumed or the query fails.

mod arena;
mod owner;
mod string_dict;

pub use arena::{Arena, ArenaBuf};
pub use owner::{RowSetMemoryOwner, StringTranslationType};
pub use string_dict::{
    DictId, StringDictionary, StringDictionaryProxy, StringId, TranslationMap, INVALID_STRING_ID,
};
