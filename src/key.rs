//! Pre-hashed lookup keys.
//!
//! A [`CacheKey`] combines three things:
//!
//! - a [`Namespace`] telling apart the record kinds that share one cache
//!   (mipmaps, blur masks, glyph metrics, ...),
//! - a 64-bit shared id grouping every entry derived from one source asset,
//! - opaque trailing bytes, a whole number of 32-bit words, describing the
//!   variant (scale, sigma, style, ...).
//!
//! The 32-bit hash is computed once at construction over the shared id and the
//! trailing bytes. The namespace takes part in equality but not in the hash, so
//! two keys differing only by namespace share a bucket and are told apart by
//! the full comparison.
//!
//! ```
//! use rescache::key::{CacheKey, Namespace};
//!
//! struct BlurMasks;
//! let a = CacheKey::new(Namespace::of::<BlurMasks>(), 42, &[1, 2, 3, 4]);
//! let b = CacheKey::from_words(Namespace::of::<BlurMasks>(), 42, &[u32::from_ne_bytes([1, 2, 3, 4])]);
//! assert_eq!(a, b);
//! assert_eq!(a.hash32(), b.hash32());
//! ```

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use smallvec::SmallVec;

use crate::error::KeyError;

/// Inline capacity for key payloads; longer payloads spill to the heap.
const INLINE_KEY_BYTES: usize = 32;

/// Bytes accounted for the fixed part of a key (namespace, shared id, hash, length).
const KEY_HEADER_BYTES: usize = 24;

/// Type discriminator for keys. Never dereferenced, only compared.
#[derive(Clone, Copy)]
pub struct Namespace {
    id: TypeId,
    name: &'static str,
}

impl Namespace {
    /// Namespace identified by the marker type `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Type name of the marker, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for Namespace {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Namespace {}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Namespace").field(&self.name).finish()
    }
}

/// Immutable, variable-length key with a precomputed hash.
#[derive(Clone)]
pub struct CacheKey {
    namespace: Namespace,
    shared_id: u64,
    hash: u32,
    payload: SmallVec<[u8; INLINE_KEY_BYTES]>,
}

impl CacheKey {
    /// Builds a key from raw trailing bytes.
    ///
    /// # Panics
    ///
    /// Panics if `payload.len()` is not a multiple of 4. Use
    /// [`try_new`](Self::try_new) when the payload comes from elsewhere.
    pub fn new(namespace: Namespace, shared_id: u64, payload: &[u8]) -> Self {
        match Self::try_new(namespace, shared_id, payload) {
            Ok(key) => key,
            Err(err) => panic!("invalid cache key: {err}"),
        }
    }

    /// Fallible form of [`new`](Self::new).
    pub fn try_new(namespace: Namespace, shared_id: u64, payload: &[u8]) -> Result<Self, KeyError> {
        if payload.len() % 4 != 0 {
            return Err(KeyError::UnalignedPayload { len: payload.len() });
        }
        let payload = SmallVec::from_slice(payload);
        let hash = hash_region(shared_id, &payload);
        Ok(Self {
            namespace,
            shared_id,
            hash,
            payload,
        })
    }

    /// Builds a key from 32-bit words, which always satisfies the layout rule.
    pub fn from_words(namespace: Namespace, shared_id: u64, words: &[u32]) -> Self {
        let payload: SmallVec<[u8; INLINE_KEY_BYTES]> =
            words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        let hash = hash_region(shared_id, &payload);
        Self {
            namespace,
            shared_id,
            hash,
            payload,
        }
    }

    #[inline]
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    #[inline]
    pub fn shared_id(&self) -> u64 {
        self.shared_id
    }

    /// The stored 32-bit hash used for table bucketing.
    #[inline]
    pub fn hash32(&self) -> u32 {
        self.hash
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Approximate footprint of the key, header included.
    pub fn size(&self) -> usize {
        KEY_HEADER_BYTES + self.payload.len()
    }
}

fn hash_region(shared_id: u64, payload: &[u8]) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(shared_id);
    hasher.write_usize(payload.len());
    for word in payload.chunks_exact(4) {
        hasher.write_u32(u32::from_ne_bytes([word[0], word[1], word[2], word[3]]));
    }
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.shared_id == other.shared_id
            && self.namespace == other.namespace
            && self.payload == other.payload
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("namespace", &self.namespace)
            .field("shared_id", &self.shared_id)
            .field("hash", &format_args!("{:#010x}", self.hash))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mips;
    struct Masks;

    #[test]
    fn equal_inputs_give_equal_keys() {
        let a = CacheKey::new(Namespace::of::<Mips>(), 7, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let b = CacheKey::new(Namespace::of::<Mips>(), 7, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(a, b);
        assert_eq!(a.hash32(), b.hash32());
        assert_eq!(a.shared_id(), 7);
        assert_eq!(a.size(), KEY_HEADER_BYTES + 8);
    }

    #[test]
    fn namespace_is_compared_but_not_hashed() {
        let a = CacheKey::new(Namespace::of::<Mips>(), 7, &[9, 9, 9, 9]);
        let b = CacheKey::new(Namespace::of::<Masks>(), 7, &[9, 9, 9, 9]);
        assert_eq!(a.hash32(), b.hash32());
        assert_ne!(a, b);
    }

    #[test]
    fn shared_id_and_payload_affect_identity() {
        let ns = Namespace::of::<Mips>();
        let base = CacheKey::new(ns, 1, &[0, 0, 0, 1]);
        assert_ne!(base, CacheKey::new(ns, 2, &[0, 0, 0, 1]));
        assert_ne!(base, CacheKey::new(ns, 1, &[0, 0, 0, 2]));
        assert_ne!(base, CacheKey::new(ns, 1, &[0, 0, 0, 1, 0, 0, 0, 0]));
    }

    #[test]
    fn empty_payload_is_valid() {
        let key = CacheKey::new(Namespace::of::<Mips>(), 3, &[]);
        assert!(key.payload().is_empty());
    }

    #[test]
    fn unaligned_payload_is_rejected() {
        let err = CacheKey::try_new(Namespace::of::<Mips>(), 1, &[1, 2, 3]).unwrap_err();
        assert_eq!(err, KeyError::UnalignedPayload { len: 3 });
    }

    #[test]
    #[should_panic(expected = "invalid cache key")]
    fn new_panics_on_unaligned_payload() {
        let _ = CacheKey::new(Namespace::of::<Mips>(), 1, &[1, 2]);
    }

    #[test]
    fn long_payload_spills_and_still_matches() {
        let words: Vec<u32> = (0..40).collect();
        let a = CacheKey::from_words(Namespace::of::<Masks>(), 5, &words);
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        let b = CacheKey::new(Namespace::of::<Masks>(), 5, &bytes);
        assert_eq!(a, b);
    }

    #[test]
    fn namespace_debug_names_marker() {
        let ns = Namespace::of::<Masks>();
        assert!(ns.name().ends_with("Masks"));
        assert!(format!("{ns:?}").contains("Masks"));
    }
}
