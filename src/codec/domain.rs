//! Codecs for domain identifiers stored by the sync indices.

use std::fmt;

use super::{Codec, CodecBuffer, CodecContext, CodecResult, VersionedCodec};

/// A 128-bit content hash, used as a compact key for labels and paths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash128 {
    pub high: u64,
    pub low: u64,
}

impl Hash128 {
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }
}

impl fmt::Display for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

/// Two fixed-width 64-bit halves, high first.
#[derive(Clone, Copy, Debug, Default)]
pub struct Hash128Codec;

impl Codec<Hash128> for Hash128Codec {
    fn encode(
        &self,
        _ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        value: &Hash128,
    ) -> CodecResult<()> {
        buf.write_i64(value.high as i64)?;
        buf.write_i64(value.low as i64)
    }

    fn decode(&self, _ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<Hash128> {
        let high = buf.read_i64()? as u64;
        let low = buf.read_i64()? as u64;
        Ok(Hash128 { high, low })
    }
}

pub fn of_hash128() -> Hash128Codec {
    Hash128Codec
}

/// A build label: `@repository//package:target`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub repository: String,
    pub package: String,
    pub target: String,
}

impl Label {
    pub fn new(
        repository: impl Into<String>,
        package: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            package: package.into(),
            target: target.into(),
        }
    }

    /// A label in the main repository.
    pub fn main(package: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new("", package, target)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.repository.is_empty() {
            write!(f, "@{}", self.repository)?;
        }
        write!(f, "//{}:{}", self.package, self.target)
    }
}

const LABEL_FORMAT_VERSION: u32 = 2;

/// Label codec.
///
/// - v1: package, target (main repository only)
/// - v2: repository, package, target
pub fn of_label() -> VersionedCodec<Label> {
    VersionedCodec::new(
        LABEL_FORMAT_VERSION,
        |_ctx, buf, label: &Label| {
            buf.write_string(&label.repository)?;
            buf.write_string(&label.package)?;
            buf.write_string(&label.target)
        },
        |_ctx, buf| {
            let repository = buf.read_string()?;
            let package = buf.read_string()?;
            let target = buf.read_string()?;
            Ok(Label {
                repository,
                package,
                target,
            })
        },
    )
    .with_legacy_decoder(1, |_ctx, buf| {
        let package = buf.read_string()?;
        let target = buf.read_string()?;
        Ok(Label::main(package, target))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_from_slice, encode_to_vec};

    #[test]
    fn test_hash128_round_trip() {
        let ctx = CodecContext::default();
        let hash = Hash128::new(u64::MAX, 0x0123_4567_89ab_cdef);
        let bytes = encode_to_vec(&of_hash128(), &ctx, &hash).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode_from_slice(&of_hash128(), &ctx, &bytes).unwrap(), hash);
        assert_eq!(hash.to_string(), "ffffffffffffffff0123456789abcdef");
    }

    #[test]
    fn test_label_round_trip() {
        let ctx = CodecContext::default();
        let label = Label::new("rules_jvm", "java/lib", "lib");
        let bytes = encode_to_vec(&of_label(), &ctx, &label).unwrap();
        assert_eq!(decode_from_slice(&of_label(), &ctx, &bytes).unwrap(), label);
        assert_eq!(label.to_string(), "@rules_jvm//java/lib:lib");
        assert_eq!(Label::main("app", "bin").to_string(), "//app:bin");
    }

    #[test]
    fn test_label_v1_still_readable() {
        let ctx = CodecContext::default();
        let mut buf = CodecBuffer::new();
        buf.write_varint(1).unwrap();
        buf.write_string("app").unwrap();
        buf.write_string("bin").unwrap();
        let bytes = buf.into_bytes();

        let decoded = decode_from_slice(&of_label(), &ctx, &bytes).unwrap();
        assert_eq!(decoded, Label::main("app", "bin"));
    }
}
