//! Shard routing hashes for cache keys.
//!
//! Every key type must implement [`ShardKey`]. Integers hash by identity, strings and
//! floats go through a fixed-seed 64-bit mix, and any other `Hash` type can opt in
//! through [`Hashed`]. There is no blanket fallback: a key type that
//! cannot be routed is a compile error, not a key that silently lands in shard 0.

use std::hash::{BuildHasher, Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;

use ahash::RandomState;
use once_cell::sync::Lazy;

// Fixed seeds keep routing identical for every manager in the process.
static ROUTING_STATE: Lazy<RandomState> = Lazy::new(|| {
  RandomState::with_seeds(
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
  )
});

#[inline]
fn mix<T: Hash + ?Sized>(value: &T) -> u64 {
  BuildHasher::hash_one(&*ROUTING_STATE, value)
}

/// The hashing capability required of every key.
///
/// The returned value picks the shard as `shard_hash() % shard_count`. It must be a
/// pure function of the key: equal keys return equal hashes for the whole lifetime
/// of the manager. Unequal keys may collide.
pub trait ShardKey {
  fn shard_hash(&self) -> u64;
}

macro_rules! identity_shard_key {
  ($($t:ty),* $(,)?) => {
    $(
      impl ShardKey for $t {
        #[inline]
        fn shard_hash(&self) -> u64 {
          *self as u64
        }
      }
    )*
  };
}

identity_shard_key!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, bool, char);

impl ShardKey for str {
  #[inline]
  fn shard_hash(&self) -> u64 {
    mix(self.as_bytes())
  }
}

impl ShardKey for String {
  #[inline]
  fn shard_hash(&self) -> u64 {
    self.as_str().shard_hash()
  }
}

impl<T: ShardKey + ?Sized> ShardKey for &T {
  #[inline]
  fn shard_hash(&self) -> u64 {
    (**self).shard_hash()
  }
}

impl<T: ShardKey + ?Sized> ShardKey for Box<T> {
  #[inline]
  fn shard_hash(&self) -> u64 {
    (**self).shard_hash()
  }
}

impl<T: ShardKey + ?Sized> ShardKey for Arc<T> {
  #[inline]
  fn shard_hash(&self) -> u64 {
    (**self).shard_hash()
  }
}

impl<T: ShardKey + ?Sized> ShardKey for Rc<T> {
  #[inline]
  fn shard_hash(&self) -> u64 {
    (**self).shard_hash()
  }
}

/// A floating point key compared and hashed by its raw bit pattern.
///
/// `NaN`, `+inf` and `-inf` are ordinary keys. Two `NaN`s with the same bits are the
/// same key, while `0.0` and `-0.0` are different keys.
#[derive(Debug, Clone, Copy)]
pub struct FloatKey(pub f64);

impl FloatKey {
  #[inline]
  pub fn bits(&self) -> u64 {
    self.0.to_bits()
  }
}

impl PartialEq for FloatKey {
  fn eq(&self, other: &Self) -> bool {
    self.bits() == other.bits()
  }
}

impl Eq for FloatKey {}

impl Hash for FloatKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.bits().hash(state);
  }
}

impl ShardKey for FloatKey {
  #[inline]
  fn shard_hash(&self) -> u64 {
    mix(&self.bits().to_ne_bytes())
  }
}

impl From<f64> for FloatKey {
  fn from(value: f64) -> Self {
    Self(value)
  }
}

/// Opts an arbitrary `Hash` type into shard routing.
///
/// Equality and `Hash` forward to the wrapped value; the shard hash is the wrapped
/// value's `Hash` output fed through the fixed-seed routing mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hashed<T>(pub T);

impl<T> Hashed<T> {
  pub fn into_inner(self) -> T {
    self.0
  }
}

impl<T: Hash> ShardKey for Hashed<T> {
  #[inline]
  fn shard_hash(&self) -> u64 {
    mix(&self.0)
  }
}
