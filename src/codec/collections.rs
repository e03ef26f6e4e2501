//! Collection codecs.
//!
//! Every collection is written as a varint element count followed by the
//! elements in iteration order. Decoding preallocates to the decoded count
//! (clamped to the bytes available). Hash-based containers therefore do not
//! have a canonical byte form; position-indexed containers (`Vec`, arrays)
//! round-trip their order exactly.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::marker::PhantomData;

use super::{capacity_hint, Codec, CodecBuffer, CodecContext, CodecError, CodecResult};

fn write_count(buf: &mut CodecBuffer, count: usize) -> CodecResult<()> {
    let count = u32::try_from(count)
        .map_err(|_| CodecError::InvalidData(format!("collection of {} elements", count)))?;
    buf.write_varint(count)
}

/// `HashSet<T>` through an element codec.
pub struct SetCodec<C, T> {
    element: C,
    _marker: PhantomData<fn() -> T>,
}

impl<C, T> SetCodec<C, T> {
    pub fn new(element: C) -> Self {
        Self {
            element,
            _marker: PhantomData,
        }
    }
}

impl<C, T> Codec<HashSet<T>> for SetCodec<C, T>
where
    C: Codec<T>,
    T: Eq + Hash,
{
    fn encode(
        &self,
        ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        value: &HashSet<T>,
    ) -> CodecResult<()> {
        write_count(buf, value.len())?;
        for item in value {
            self.element.encode(ctx, buf, item)?;
        }
        Ok(())
    }

    fn decode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<HashSet<T>> {
        let count = buf.read_len()?;
        let mut set = HashSet::with_capacity(capacity_hint(buf, count));
        for _ in 0..count {
            set.insert(self.element.decode(ctx, buf)?);
        }
        Ok(set)
    }
}

/// `Vec<T>` through an element codec.
pub struct ListCodec<C, T> {
    element: C,
    _marker: PhantomData<fn() -> T>,
}

impl<C, T> ListCodec<C, T> {
    pub fn new(element: C) -> Self {
        Self {
            element,
            _marker: PhantomData,
        }
    }
}

impl<C, T> Codec<Vec<T>> for ListCodec<C, T>
where
    C: Codec<T>,
{
    fn encode(
        &self,
        ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        value: &Vec<T>,
    ) -> CodecResult<()> {
        write_count(buf, value.len())?;
        for item in value {
            self.element.encode(ctx, buf, item)?;
        }
        Ok(())
    }

    fn decode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<Vec<T>> {
        let count = buf.read_len()?;
        let mut list = Vec::with_capacity(capacity_hint(buf, count));
        for _ in 0..count {
            list.push(self.element.decode(ctx, buf)?);
        }
        Ok(list)
    }
}

/// `HashMap<K, V>` through key and value codecs.
pub struct MapCodec<KC, VC, K, V> {
    key: KC,
    value: VC,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<KC, VC, K, V> MapCodec<KC, VC, K, V> {
    pub fn new(key: KC, value: VC) -> Self {
        Self {
            key,
            value,
            _marker: PhantomData,
        }
    }
}

impl<KC, VC, K, V> Codec<HashMap<K, V>> for MapCodec<KC, VC, K, V>
where
    KC: Codec<K>,
    VC: Codec<V>,
    K: Eq + Hash,
{
    fn encode(
        &self,
        ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        map: &HashMap<K, V>,
    ) -> CodecResult<()> {
        write_count(buf, map.len())?;
        for (k, v) in map {
            self.key.encode(ctx, buf, k)?;
            self.value.encode(ctx, buf, v)?;
        }
        Ok(())
    }

    fn decode(&self, ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<HashMap<K, V>> {
        let count = buf.read_len()?;
        let mut map = HashMap::with_capacity(capacity_hint(buf, count));
        for _ in 0..count {
            let k = self.key.decode(ctx, buf)?;
            let v = self.value.decode(ctx, buf)?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

/// `HashSet<i32>` with zig-zag varint elements.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntSetCodec;

impl Codec<HashSet<i32>> for IntSetCodec {
    fn encode(
        &self,
        _ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        value: &HashSet<i32>,
    ) -> CodecResult<()> {
        write_count(buf, value.len())?;
        for item in value {
            buf.write_signed_varint(*item)?;
        }
        Ok(())
    }

    fn decode(&self, _ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<HashSet<i32>> {
        let count = buf.read_len()?;
        let mut set = HashSet::with_capacity(capacity_hint(buf, count));
        for _ in 0..count {
            set.insert(buf.read_signed_varint()?);
        }
        Ok(set)
    }
}

/// `HashMap<i32, V>` with zig-zag varint keys.
pub struct IntMapCodec<VC, V> {
    value: VC,
    _marker: PhantomData<fn() -> V>,
}

impl<VC, V> IntMapCodec<VC, V> {
    pub fn new(value: VC) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }
}

impl<VC, V> Codec<HashMap<i32, V>> for IntMapCodec<VC, V>
where
    VC: Codec<V>,
{
    fn encode(
        &self,
        ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        map: &HashMap<i32, V>,
    ) -> CodecResult<()> {
        write_count(buf, map.len())?;
        for (k, v) in map {
            buf.write_signed_varint(*k)?;
            self.value.encode(ctx, buf, v)?;
        }
        Ok(())
    }

    fn decode(
        &self,
        ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
    ) -> CodecResult<HashMap<i32, V>> {
        let count = buf.read_len()?;
        let mut map = HashMap::with_capacity(capacity_hint(buf, count));
        for _ in 0..count {
            let k = buf.read_signed_varint()?;
            let v = self.value.decode(ctx, buf)?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

/// `HashMap<K, i32>` with zig-zag varint values.
pub struct ObjectIntMapCodec<KC, K> {
    key: KC,
    _marker: PhantomData<fn() -> K>,
}

impl<KC, K> ObjectIntMapCodec<KC, K> {
    pub fn new(key: KC) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }
}

impl<KC, K> Codec<HashMap<K, i32>> for ObjectIntMapCodec<KC, K>
where
    KC: Codec<K>,
    K: Eq + Hash,
{
    fn encode(
        &self,
        ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        map: &HashMap<K, i32>,
    ) -> CodecResult<()> {
        write_count(buf, map.len())?;
        for (k, v) in map {
            self.key.encode(ctx, buf, k)?;
            buf.write_signed_varint(*v)?;
        }
        Ok(())
    }

    fn decode(
        &self,
        ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
    ) -> CodecResult<HashMap<K, i32>> {
        let count = buf.read_len()?;
        let mut map = HashMap::with_capacity(capacity_hint(buf, count));
        for _ in 0..count {
            let k = self.key.decode(ctx, buf)?;
            map.insert(k, buf.read_signed_varint()?);
        }
        Ok(map)
    }
}

/// Growable int list, element-wise zig-zag varints. Compact for small ids.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntListCodec;

impl Codec<Vec<i32>> for IntListCodec {
    fn encode(
        &self,
        _ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        value: &Vec<i32>,
    ) -> CodecResult<()> {
        write_count(buf, value.len())?;
        for item in value {
            buf.write_signed_varint(*item)?;
        }
        Ok(())
    }

    fn decode(&self, _ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<Vec<i32>> {
        let count = buf.read_len()?;
        let mut list = Vec::with_capacity(capacity_hint(buf, count));
        for _ in 0..count {
            list.push(buf.read_signed_varint()?);
        }
        Ok(list)
    }
}

/// Int array as one fixed-width little-endian block.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntArrayCodec;

impl Codec<Vec<i32>> for IntArrayCodec {
    fn encode(
        &self,
        _ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        value: &Vec<i32>,
    ) -> CodecResult<()> {
        write_count(buf, value.len())?;
        buf.write_i32_slice(value)
    }

    fn decode(&self, _ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<Vec<i32>> {
        let count = buf.read_len()?;
        buf.read_i32_vec(count)
    }
}

/// Long array as one fixed-width little-endian block.
#[derive(Clone, Copy, Debug, Default)]
pub struct LongArrayCodec;

impl Codec<Vec<i64>> for LongArrayCodec {
    fn encode(
        &self,
        _ctx: &CodecContext<'_>,
        buf: &mut CodecBuffer,
        value: &Vec<i64>,
    ) -> CodecResult<()> {
        write_count(buf, value.len())?;
        buf.write_i64_slice(value)
    }

    fn decode(&self, _ctx: &CodecContext<'_>, buf: &mut CodecBuffer) -> CodecResult<Vec<i64>> {
        let count = buf.read_len()?;
        buf.read_i64_vec(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_from_slice, encode_to_vec, of_int, of_string};

    fn round_trip<T, C: Codec<T>>(codec: &C, value: &T) -> T {
        let ctx = CodecContext::default();
        let bytes = encode_to_vec(codec, &ctx, value).unwrap();
        decode_from_slice(codec, &ctx, &bytes).unwrap()
    }

    #[test]
    fn test_set_and_list() {
        let set: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(round_trip(&SetCodec::new(of_string()), &set), set);

        let list = vec![3, 1, 2, 1];
        assert_eq!(round_trip(&ListCodec::new(of_int()), &list), list);
    }

    #[test]
    fn test_maps() {
        let mut map = HashMap::new();
        map.insert("x".to_string(), vec![1, 2]);
        map.insert("y".to_string(), vec![]);
        let codec = MapCodec::new(of_string(), IntListCodec);
        assert_eq!(round_trip(&codec, &map), map);

        let mut successors = HashMap::new();
        successors.insert(-4, vec![7, 8, 9]);
        successors.insert(12, vec![0]);
        assert_eq!(round_trip(&IntMapCodec::new(IntArrayCodec), &successors), successors);

        let mut ids = HashMap::new();
        ids.insert("//a:a".to_string(), 0);
        ids.insert("//b:b".to_string(), 1);
        assert_eq!(round_trip(&ObjectIntMapCodec::new(of_string()), &ids), ids);
    }

    #[test]
    fn test_int_set() {
        let set: HashSet<i32> = [i32::MIN, -1, 0, 1, i32::MAX].into_iter().collect();
        assert_eq!(round_trip(&IntSetCodec, &set), set);
    }

    #[test]
    fn test_arrays_preserve_position() {
        let ints = vec![9, -9, 0, 9];
        assert_eq!(round_trip(&IntArrayCodec, &ints), ints);
        assert_eq!(round_trip(&IntListCodec, &ints), ints);

        let longs = vec![1i64 << 50, -7, 0];
        assert_eq!(round_trip(&LongArrayCodec, &longs), longs);
    }

    #[test]
    fn test_empty_collections() {
        assert!(round_trip(&IntArrayCodec, &Vec::<i32>::new()).is_empty());
        assert!(round_trip(&IntSetCodec, &HashSet::<i32>::new()).is_empty());
    }

    #[test]
    fn test_corrupted_count_does_not_preallocate() {
        let ctx = CodecContext::default();
        let mut buf = CodecBuffer::new();
        buf.write_varint(u32::MAX).unwrap();
        buf.write_i32(1).unwrap();
        let bytes = buf.into_bytes();
        let err = decode_from_slice(&ListCodec::new(of_int()), &ctx, &bytes).unwrap_err();
        assert!(matches!(err, CodecError::Underflow { .. }));
    }
}
