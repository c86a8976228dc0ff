//! Column encoders and chunk statistics.
//!
//! An encoder is bound 1:1 to the buffer it serializes into: it narrows
//! logical values to the column's physical width during ingest, keeps
//! running min/max/has-nulls statistics the query layer uses for
//! predicate pushdown, and (de)serializes its own metadata record.

mod fixed_length;
mod metadata;

pub use fixed_length::{new_encoder, Encoder, EncodingSpec};
pub use metadata::ChunkMetadata;
