use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Total order over encoded keys.
///
/// Implementations must return `Equal` only for byte-identical keys; the
/// components index keys by their bytes and order them with the comparer.
pub trait KeyComparer: Send + Sync + fmt::Debug {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

pub type SharedComparer = Arc<dyn KeyComparer>;

/// Lexicographic byte order.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparer;

impl KeyComparer for BytewiseComparer {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Shared handle to [`BytewiseComparer`].
pub fn bytewise() -> SharedComparer {
    Arc::new(BytewiseComparer)
}
