//! Binary codec framework.
//!
//! A [`Codec`] is a pure encode/decode pair for a value type over a
//! [`CodecBuffer`]. Codecs hold no mutable state, so the same instance can be
//! shared by every store and thread. Larger codecs are composed from the
//! primitives in this module, the collection combinators in
//! [`collections`], converters ([`CodecExt::with_converter`]) and
//! [`VersionedCodec`] wrappers for formats that may evolve.

pub mod buffer;
pub mod collections;
pub mod domain;
pub mod versioned;

pub use buffer::CodecBuffer;
pub use collections::{
    IntArrayCodec, IntListCodec, IntMapCodec, IntSetCodec, ListCodec, LongArrayCodec, MapCodec,
    ObjectIntMapCodec, SetCodec,
};
pub use domain::{of_hash128, of_label, Hash128, Hash128Codec, Label};
pub use versioned::VersionedCodec;

use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Codec errors.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unsupported buffer operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("Buffer underflow: needed {needed} bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },

    #[error("Unknown codec version {version} (supported: {supported:?})")]
    UnknownVersion { version: u32, supported: Vec<u32> },

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Ambient information handed to every codec call.
///
/// Only used for diagnostics; it never influences the bytes produced.
#[derive(Clone, Copy, Debug)]
pub struct CodecContext<'a> {
    store: &'a str,
}

impl<'a> CodecContext<'a> {
    pub fn new(store: &'a str) -> Self {
        Self { store }
    }

    /// Name of the store this call encodes for.
    pub fn store(&self) -> &'a str {
        self.store
    }
}

impl Default for CodecContext<'static> {
    fn default() -> Self {
        Self { store: "" }
    }
}

/// A pure encode/decode pair for `T`.
///
/// Implementations must satisfy `decode(encode(v)) == v` and must not consult
/// any mutable global state.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer, value: &T) -> CodecResult<()>;

    fn decode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<T>;
}

impl<T, C: Codec<T> + ?Sized> Codec<T> for Arc<C> {
    fn encode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer, value: &T) -> CodecResult<()> {
        (**self).encode(ctx, buf, value)
    }

    fn decode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<T> {
        (**self).decode(ctx, buf)
    }
}

impl<T, C: Codec<T> + ?Sized> Codec<T> for Box<C> {
    fn encode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer, value: &T) -> CodecResult<()> {
        (**self).encode(ctx, buf, value)
    }

    fn decode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<T> {
        (**self).decode(ctx, buf)
    }
}

/// Encodes `value` into a fresh buffer and returns the bytes.
pub fn encode_to_vec<T, C: Codec<T> + ?Sized>(
    codec: &C,
    ctx: &CodecContext<'_>,
    value: &T,
) -> CodecResult<Vec<u8>> {
    let mut buf = CodecBuffer::new();
    codec.encode(ctx, &mut buf, value)?;
    Ok(buf.into_bytes())
}

/// Decodes a value from `bytes`.
pub fn decode_from_slice<T, C: Codec<T> + ?Sized>(
    codec: &C,
    ctx: &CodecContext<'_>,
    bytes: &[u8],
) -> CodecResult<T> {
    let mut buf = CodecBuffer::from_slice(bytes);
    codec.decode(ctx, &mut buf)
}

/// Combinators available on every codec.
pub trait CodecExt<U>: Codec<U> + Sized {
    /// Lifts this `Codec<U>` to a `Codec<V>` through a bidirectional mapping.
    ///
    /// `to` and `from` must be total and inverse of each other for every
    /// value that is ever encoded.
    fn with_converter<V, To, From>(self, to: To, from: From) -> Converted<Self, U, To, From>
    where
        To: Fn(&V) -> U + Send + Sync,
        From: Fn(U) -> V + Send + Sync,
    {
        Converted {
            inner: self,
            to,
            from,
            _marker: PhantomData,
        }
    }
}

impl<U, C: Codec<U>> CodecExt<U> for C {}

/// A codec adapted through a converter. See [`CodecExt::with_converter`].
pub struct Converted<C, U, To, From> {
    inner: C,
    to: To,
    from: From,
    _marker: PhantomData<fn() -> U>,
}

impl<V, U, C, To, From> Codec<V> for Converted<C, U, To, From>
where
    C: Codec<U>,
    To: Fn(&V) -> U + Send + Sync,
    From: Fn(U) -> V + Send + Sync,
{
    fn encode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer, value: &V) -> CodecResult<()> {
        self.inner.encode(ctx, buf, &(self.to)(value))
    }

    fn decode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<V> {
        self.inner.decode(ctx, buf).map(&self.from)
    }
}

// ---------------------------------------------------------------------------
// Primitive codecs
// ---------------------------------------------------------------------------

/// Fixed-width little-endian `i32`.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntCodec;

impl Codec<i32> for IntCodec {
    fn encode(
        &self,
        _ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        value: &i32,
    ) -> CodecResult<()> {
        buf.write_i32(*value)
    }

    fn decode(&self, _ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<i32> {
        buf.read_i32()
    }
}

/// Fixed-width little-endian `i64`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LongCodec;

impl Codec<i64> for LongCodec {
    fn encode(
        &self,
        _ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        value: &i64,
    ) -> CodecResult<()> {
        buf.write_i64(*value)
    }

    fn decode(&self, _ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<i64> {
        buf.read_i64()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BoolCodec;

impl Codec<bool> for BoolCodec {
    fn encode(
        &self,
        _ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        value: &bool,
    ) -> CodecResult<()> {
        buf.write_bool(*value)
    }

    fn decode(&self, _ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<bool> {
        buf.read_bool()
    }
}

/// Length-prefixed UTF-8.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(
        &self,
        _ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        value: &String,
    ) -> CodecResult<()> {
        buf.write_string(value)
    }

    fn decode(&self, _ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<String> {
        buf.read_string()
    }
}

/// Length-prefixed raw bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(
        &self,
        _ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        value: &Vec<u8>,
    ) -> CodecResult<()> {
        let len = u32::try_from(value.len())
            .map_err(|_| CodecError::InvalidData(format!("byte string of {} bytes", value.len())))?;
        buf.write_varint(len)?;
        buf.write_bytes(value)
    }

    fn decode(&self, _ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<Vec<u8>> {
        let len = buf.read_len()?;
        buf.read_bytes(len)
    }
}

pub fn of_int() -> IntCodec {
    IntCodec
}

pub fn of_long() -> LongCodec {
    LongCodec
}

pub fn of_bool() -> BoolCodec {
    BoolCodec
}

pub fn of_string() -> StringCodec {
    StringCodec
}

pub fn of_bytes() -> BytesCodec {
    BytesCodec
}

/// Capacity hint for a decoded collection of `count` elements.
///
/// Clamped to the bytes left in the buffer so a corrupted count cannot
/// trigger a huge allocation; every element takes at least one byte.
pub(crate) fn capacity_hint(buf: &CodecBuffer, count: usize) -> usize {
    count.min(buf.remaining())
}
