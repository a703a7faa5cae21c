use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one side of a relayed stream.
///
/// Remote peers are numbered from 1 in accept order; `PeerId::LOCAL` is the
/// session's own capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    pub const LOCAL: PeerId = PeerId(0);

    pub fn next() -> PeerId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        PeerId(ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn is_local(&self) -> bool {
        *self == PeerId::LOCAL
    }
}

impl Deref for PeerId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            f.write_str("local")
        } else {
            write!(f, "peer-{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PeerId;

    #[test]
    fn ids_are_unique_and_never_local() {
        let a = PeerId::next();
        let b = PeerId::next();
        assert_ne!(a, b);
        assert!(!a.is_local());
        assert!(a < b);
        assert_eq!(PeerId::LOCAL.to_string(), "local");
    }
}
