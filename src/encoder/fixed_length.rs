//! Fixed-length encoder - narrows a logical integer type to a smaller
//! physical representation while tracking min/max/null statistics.

use std::io::{Read, Write};
use std::marker::PhantomData;

use tracing::error;

use crate::buffer::Buffer;
use crate::common::{Error, Result};
use crate::encoder::ChunkMetadata;

/// The closed set of supported (logical, physical) width pairs.
///
/// Each variant names the logical integer type a column is declared as
/// and the physical width its bytes are stored at. Keeping the set
/// closed (instead of arbitrary type pairs) lets every dispatch site
/// match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingSpec {
    I64ToI64,
    I64ToI32,
    I64ToI16,
    I64ToI8,
    I32ToI32,
    I32ToI16,
    I32ToI8,
    I16ToI16,
    I16ToI8,
    I8ToI8,
}

impl EncodingSpec {
    /// Bytes per element of the logical (in-memory, unencoded) type.
    pub fn logical_size(self) -> usize {
        match self {
            Self::I64ToI64 | Self::I64ToI32 | Self::I64ToI16 | Self::I64ToI8 => 8,
            Self::I32ToI32 | Self::I32ToI16 | Self::I32ToI8 => 4,
            Self::I16ToI16 | Self::I16ToI8 => 2,
            Self::I8ToI8 => 1,
        }
    }

    /// Bytes per element of the physical (stored) type.
    pub fn physical_size(self) -> usize {
        match self {
            Self::I64ToI64 => 8,
            Self::I64ToI32 | Self::I32ToI32 => 4,
            Self::I64ToI16 | Self::I32ToI16 | Self::I16ToI16 => 2,
            Self::I64ToI8 | Self::I32ToI8 | Self::I16ToI8 | Self::I8ToI8 => 1,
        }
    }

    /// Stable on-disk tag for the chunk index.
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::I64ToI64 => 0,
            Self::I64ToI32 => 1,
            Self::I64ToI16 => 2,
            Self::I64ToI8 => 3,
            Self::I32ToI32 => 4,
            Self::I32ToI16 => 5,
            Self::I32ToI8 => 6,
            Self::I16ToI16 => 7,
            Self::I16ToI8 => 8,
            Self::I8ToI8 => 9,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::I64ToI64,
            1 => Self::I64ToI32,
            2 => Self::I64ToI16,
            3 => Self::I64ToI8,
            4 => Self::I32ToI32,
            5 => Self::I32ToI16,
            6 => Self::I32ToI8,
            7 => Self::I16ToI16,
            8 => Self::I16ToI8,
            9 => Self::I8ToI8,
            _ => return None,
        })
    }
}

/// Capability interface of a column encoder bound to one buffer.
///
/// All implementations maintain the invariant that after every
/// successful append, `num_elements() * physical_size()` equals the
/// bound buffer's used byte count.
pub trait Encoder: Send {
    /// Narrow and append `num_elems` logical values from the front of
    /// `src` into `buffer`, advancing `src` past the consumed bytes and
    /// returning updated chunk metadata.
    ///
    /// On any error nothing is appended and the statistics are left
    /// untouched.
    fn append_data(
        &mut self,
        buffer: &mut Buffer,
        src: &mut &[u8],
        num_elems: usize,
    ) -> Result<ChunkMetadata>;

    /// Snapshot of the running statistics.
    fn metadata(&self) -> ChunkMetadata;

    /// Overwrite the running statistics from a snapshot.
    fn copy_metadata(&mut self, metadata: &ChunkMetadata);

    /// Serialize the statistics record: `{element count, min, max,
    /// has_nulls}`, raw native-endian fixed-width fields, no padding.
    /// Assumes the stream position is pre-seeked by the caller.
    fn write_metadata(&self, out: &mut dyn Write) -> Result<()>;

    /// Deserialize a statistics record written by [`write_metadata`].
    ///
    /// A short read is fatal: partial metadata cannot be trusted for
    /// min/max pruning.
    ///
    /// [`write_metadata`]: Encoder::write_metadata
    fn read_metadata(&mut self, input: &mut dyn Read) -> Result<()>;

    fn num_elements(&self) -> usize;

    fn physical_size(&self) -> usize;

    fn spec(&self) -> EncodingSpec;
}

/// Construct the encoder for a spec.
pub fn new_encoder(spec: EncodingSpec) -> Box<dyn Encoder> {
    match spec {
        EncodingSpec::I64ToI64 => Box::new(FixedLengthEncoder::<i64, i64>::new(spec)),
        EncodingSpec::I64ToI32 => Box::new(FixedLengthEncoder::<i64, i32>::new(spec)),
        EncodingSpec::I64ToI16 => Box::new(FixedLengthEncoder::<i64, i16>::new(spec)),
        EncodingSpec::I64ToI8 => Box::new(FixedLengthEncoder::<i64, i8>::new(spec)),
        EncodingSpec::I32ToI32 => Box::new(FixedLengthEncoder::<i32, i32>::new(spec)),
        EncodingSpec::I32ToI16 => Box::new(FixedLengthEncoder::<i32, i16>::new(spec)),
        EncodingSpec::I32ToI8 => Box::new(FixedLengthEncoder::<i32, i8>::new(spec)),
        EncodingSpec::I16ToI16 => Box::new(FixedLengthEncoder::<i16, i16>::new(spec)),
        EncodingSpec::I16ToI8 => Box::new(FixedLengthEncoder::<i16, i8>::new(spec)),
        EncodingSpec::I8ToI8 => Box::new(FixedLengthEncoder::<i8, i8>::new(spec)),
    }
}

/// Fixed-width signed integer usable as a logical or physical type.
trait FixedWidth: Copy + Ord + Send + 'static {
    const WIDTH: usize;
    /// The storage-level null convention: the type's minimum value.
    const NULL_SENTINEL: Self;
    const MAX_VALUE: Self;

    fn from_ne_slice(bytes: &[u8]) -> Self;
    fn push_ne(self, dst: &mut Vec<u8>);
    fn write_ne(self, out: &mut dyn Write) -> std::io::Result<()>;
    fn read_ne(input: &mut dyn Read) -> std::io::Result<Self>;
    fn to_i64(self) -> i64;
    fn from_i64(value: i64) -> Self;
}

macro_rules! impl_fixed_width {
    ($ty:ty) => {
        impl FixedWidth for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();
            const NULL_SENTINEL: Self = <$ty>::MIN;
            const MAX_VALUE: Self = <$ty>::MAX;

            fn from_ne_slice(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                Self::from_ne_bytes(raw)
            }

            fn push_ne(self, dst: &mut Vec<u8>) {
                dst.extend_from_slice(&self.to_ne_bytes());
            }

            fn write_ne(self, out: &mut dyn Write) -> std::io::Result<()> {
                out.write_all(&self.to_ne_bytes())
            }

            fn read_ne(input: &mut dyn Read) -> std::io::Result<Self> {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                input.read_exact(&mut raw)?;
                Ok(Self::from_ne_bytes(raw))
            }

            fn to_i64(self) -> i64 {
                self as i64
            }

            fn from_i64(value: i64) -> Self {
                value as $ty
            }
        }
    };
}

impl_fixed_width!(i8);
impl_fixed_width!(i16);
impl_fixed_width!(i32);
impl_fixed_width!(i64);

/// Encoder narrowing logical `T` values to physical `V` storage.
///
/// Statistics start inverted (`min = T::MAX`, `max = T::MIN`) so the
/// first non-null value establishes the range, matching the metadata of
/// an empty chunk being maximally restrictive.
struct FixedLengthEncoder<T, V> {
    spec: EncodingSpec,
    num_elems: usize,
    data_min: T,
    data_max: T,
    has_nulls: bool,
    _physical: PhantomData<V>,
}

impl<T: FixedWidth, V: FixedWidth + TryFrom<T>> FixedLengthEncoder<T, V> {
    fn new(spec: EncodingSpec) -> Self {
        debug_assert_eq!(spec.logical_size(), T::WIDTH);
        debug_assert_eq!(spec.physical_size(), V::WIDTH);
        Self {
            spec,
            num_elems: 0,
            data_min: T::MAX_VALUE,
            data_max: T::NULL_SENTINEL,
            has_nulls: false,
            _physical: PhantomData,
        }
    }
}

impl<T: FixedWidth, V: FixedWidth + TryFrom<T>> Encoder for FixedLengthEncoder<T, V> {
    fn append_data(
        &mut self,
        buffer: &mut Buffer,
        src: &mut &[u8],
        num_elems: usize,
    ) -> Result<ChunkMetadata> {
        let needed = num_elems * T::WIDTH;
        if src.len() < needed {
            return Err(Error::TruncatedSource {
                needed,
                available: src.len(),
            });
        }

        // Stage encoded bytes and statistics; commit only after the
        // buffer accepts the append, so a capacity or overflow failure
        // leaves both the buffer and the statistics untouched.
        let mut encoded = Vec::with_capacity(num_elems * V::WIDTH);
        let mut min = self.data_min;
        let mut max = self.data_max;
        let mut has_nulls = self.has_nulls;

        for i in 0..num_elems {
            let value = T::from_ne_slice(&src[i * T::WIDTH..(i + 1) * T::WIDTH]);
            if value == T::NULL_SENTINEL {
                // Nulls are stored as the physical sentinel and excluded
                // from the range.
                has_nulls = true;
                V::NULL_SENTINEL.push_ne(&mut encoded);
            } else {
                let narrowed = match V::try_from(value) {
                    Ok(v) => v,
                    Err(_) => {
                        error!(
                            value = value.to_i64(),
                            physical_width = V::WIDTH,
                            "fixed-width encoding failed: value does not survive the round trip"
                        );
                        return Err(Error::EncodingOverflow {
                            value: value.to_i64(),
                        });
                    }
                };
                min = min.min(value);
                max = max.max(value);
                narrowed.push_ne(&mut encoded);
            }
        }

        buffer.append(&encoded)?;

        self.num_elems += num_elems;
        self.data_min = min;
        self.data_max = max;
        self.has_nulls = has_nulls;
        *src = &src[needed..];
        Ok(self.metadata())
    }

    fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            num_elements: self.num_elems,
            physical_size: V::WIDTH,
            min: self.data_min.to_i64(),
            max: self.data_max.to_i64(),
            has_nulls: self.has_nulls,
        }
    }

    fn copy_metadata(&mut self, metadata: &ChunkMetadata) {
        self.num_elems = metadata.num_elements;
        self.data_min = T::from_i64(metadata.min);
        self.data_max = T::from_i64(metadata.max);
        self.has_nulls = metadata.has_nulls;
    }

    fn write_metadata(&self, out: &mut dyn Write) -> Result<()> {
        let io = |source| Error::MetadataIo { source };
        out.write_all(&(self.num_elems as u64).to_ne_bytes())
            .map_err(io)?;
        self.data_min.write_ne(out).map_err(io)?;
        self.data_max.write_ne(out).map_err(io)?;
        out.write_all(&[self.has_nulls as u8]).map_err(io)?;
        Ok(())
    }

    fn read_metadata(&mut self, input: &mut dyn Read) -> Result<()> {
        let io = |source| Error::MetadataIo { source };
        let mut count = [0u8; 8];
        input.read_exact(&mut count).map_err(io)?;
        self.num_elems = u64::from_ne_bytes(count) as usize;
        self.data_min = T::read_ne(input).map_err(io)?;
        self.data_max = T::read_ne(input).map_err(io)?;
        let mut nulls = [0u8; 1];
        input.read_exact(&mut nulls).map_err(io)?;
        self.has_nulls = nulls[0] != 0;
        Ok(())
    }

    fn num_elements(&self) -> usize {
        self.num_elems
    }

    fn physical_size(&self) -> usize {
        V::WIDTH
    }

    fn spec(&self) -> EncodingSpec {
        self.spec
    }
}
