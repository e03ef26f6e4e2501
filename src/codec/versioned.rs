//! Version-tagged codecs.
//!
//! The version is written as a varint before the payload. Decoding reads it
//! first and dispatches to the decoder registered for that exact version;
//! the version is never inferred from the payload shape.

use std::collections::BTreeMap;

use super::{Codec, CodecBuffer, CodecContext, CodecError, CodecResult};

type EncodeFn<T> =
    Box<dyn Fn(&CodecContext<'_>, &mut CodecBuffer, &T) -> CodecResult<()> + Send + Sync>;
type DecodeFn<T> = Box<dyn Fn(&CodecContext<'_>, &mut CodecBuffer) -> CodecResult<T> + Send + Sync>;

/// A codec that prefixes its payload with a format version.
pub struct VersionedCodec<T> {
    version: u32,
    encode: EncodeFn<T>,
    decoders: BTreeMap<u32, DecodeFn<T>>,
}

impl<T: 'static> VersionedCodec<T> {
    /// Creates a codec writing `version`, with the matching decoder.
    pub fn new<E, D>(version: u32, encode: E, decode: D) -> Self
    where
        E: Fn(&CodecContext<'_>, &mut CodecBuffer, &T) -> CodecResult<()> + Send + Sync + 'static,
        D: Fn(&CodecContext<'_>, &mut CodecBuffer) -> CodecResult<T> + Send + Sync + 'static,
    {
        let mut decoders: BTreeMap<u32, DecodeFn<T>> = BTreeMap::new();
        decoders.insert(version, Box::new(decode));
        Self {
            version,
            encode: Box::new(encode),
            decoders,
        }
    }

    /// Wraps an existing codec as the payload of `version`.
    pub fn wrap<C>(version: u32, codec: C) -> Self
    where
        C: Codec<T> + Clone + 'static,
    {
        let decoder = codec.clone();
        Self::new(
            version,
            move |ctx, buf, value| codec.encode(ctx, buf, value),
            move |ctx, buf| decoder.decode(ctx, buf),
        )
    }

    /// Registers a decoder for an older format still found on disk.
    pub fn with_legacy_decoder<D>(mut self, version: u32, decode: D) -> Self
    where
        D: Fn(&CodecContext<'_>, &mut CodecBuffer) -> CodecResult<T> + Send + Sync + 'static,
    {
        self.decoders.entry(version).or_insert_with(|| Box::new(decode));
        self
    }

    /// The version written by `encode`.
    pub fn version(&self) -> u32 {
        self.version
    }
}

impl<T> Codec<T> for VersionedCodec<T> {
    fn encode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer, value: &T) -> CodecResult<()> {
        buf.write_varint(self.version)?;
        (self.encode)(ctx, buf, value)
    }

    fn decode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<T> {
        let version = buf.read_varint()?;
        match self.decoders.get(&version) {
            Some(decode) => decode(ctx, buf),
            None => Err(CodecError::UnknownVersion {
                version,
                supported: self.decoders.keys().copied().collect(),
            }),
        }
    }
}
