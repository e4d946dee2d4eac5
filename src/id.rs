use std::fmt;

use rand::Rng;

/// Largest value of a 16-bit position digit, site, or offset.
pub const MAX_DIGIT: u16 = u16::MAX;

/// A Logoot-Split identifier.
///
/// The underlying byte string is a sequence of big-endian 16-bit words:
/// zero or more position digits, then the originating site, then the
/// intra-block offset. Identifiers are ordered by comparing raw bytes, so a
/// strict prefix sorts before any of its extensions. The empty identifier is
/// the "past end" sentinel: as a low neighbor it behaves as if padded with
/// zeros, as a high neighbor as if padded with `MAX_DIGIT`.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(Vec<u8>);

impl Id {
    pub fn empty() -> Self {
        Id(Vec::new())
    }

    /// Validates a decoded byte string: an even number of bytes, and room
    /// for at least one position digit plus site and offset when non-empty.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() % 2 != 0 || (!bytes.is_empty() && bytes.len() < 6) {
            return None;
        }
        Some(Id(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The intra-block offset: the last 16-bit word.
    pub fn offset(&self) -> u16 {
        let n = self.0.len();
        u16::from_be_bytes([self.0[n - 2], self.0[n - 1]])
    }

    /// The originating site: the 16-bit word before the offset.
    pub fn site(&self) -> u16 {
        let n = self.0.len();
        u16::from_be_bytes([self.0[n - 4], self.0[n - 3]])
    }

    /// Two identifiers share a base iff they have equal length and equal
    /// bytes everywhere except the trailing offset word.
    pub fn base_eq(&self, other: &Id) -> bool {
        self.0.len() == other.0.len()
            && !self.0.is_empty()
            && self.0[..self.0.len() - 2] == other.0[..other.0.len() - 2]
    }

    /// A copy of this identifier with the offset word replaced.
    pub fn with_offset(&self, offset: u16) -> Id {
        let mut bytes = self.0.clone();
        let n = bytes.len();
        bytes[n - 2..].copy_from_slice(&offset.to_be_bytes());
        Id(bytes)
    }

    /// Generates an identifier strictly between `low` and `high` for `site`.
    ///
    /// Both neighbors are effective identifiers (offset already embedded);
    /// `None` stands for the document edge. The walk reads 16-bit words left
    /// to right, taking `0` past the end of `low` and `MAX_DIGIT` past the
    /// end of `high`. While the words are too close to fit anything between
    /// them it emits the low word and advances; once an emitted word falls
    /// strictly below the high side, the high bound is unconstrained for the
    /// rest of the walk. The first gap of two or more yields a uniformly
    /// random word from the open interval, and the result is completed with
    /// `site` and offset `0`. The random word plus the site tag make the
    /// resulting base unique to this call.
    pub fn between<R: Rng>(low: Option<&Id>, high: Option<&Id>, site: u16, rng: &mut R) -> Id {
        let lo = low.map(|id| id.as_bytes()).unwrap_or(&[]);
        let hi = high.map(|id| id.as_bytes()).unwrap_or(&[]);
        let word = |bytes: &[u8], i: usize, pad: u16| {
            if 2 * i + 1 < bytes.len() {
                u16::from_be_bytes([bytes[2 * i], bytes[2 * i + 1]])
            } else {
                pad
            }
        };

        let mut out = Vec::with_capacity(lo.len().max(6) + 2);
        let mut unbounded = false;
        let mut i = 0;
        loop {
            let l = word(lo, i, 0);
            let h = if unbounded {
                MAX_DIGIT
            } else {
                word(hi, i, MAX_DIGIT)
            };
            if h.saturating_sub(l) >= 2 {
                let m = rng.gen_range(l + 1..h);
                out.extend_from_slice(&m.to_be_bytes());
                break;
            }
            out.extend_from_slice(&l.to_be_bytes());
            if h > l {
                unbounded = true;
            }
            i += 1;
        }
        out.extend_from_slice(&site.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        Id(out)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id(")?;
        for (i, pair) in self.0.chunks(2).enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{:04x}", u16::from_be_bytes([pair[0], pair[1]]))?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::thread_rng;

    fn id(words: &[u16]) -> Id {
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_be_bytes());
        }
        Id(bytes)
    }

    #[test]
    fn accessors() {
        let a = id(&[7, 3, 9]);
        assert_eq!(a.offset(), 9);
        assert_eq!(a.site(), 3);
        assert_eq!(a.with_offset(12).offset(), 12);
        assert!(a.base_eq(&a.with_offset(12)));
        assert!(!a.base_eq(&id(&[7, 3])));
        assert!(!a.base_eq(&id(&[8, 3, 9])));
    }

    #[test]
    fn from_bytes_rejects_odd_and_short() {
        assert!(Id::from_bytes(vec![1]).is_none());
        assert!(Id::from_bytes(vec![0, 1, 0, 2]).is_none());
        assert!(Id::from_bytes(vec![]).is_some());
        assert!(Id::from_bytes(vec![0, 1, 0, 2, 0, 3]).is_some());
    }

    #[test]
    fn between_document_edges() {
        let mut rng = thread_rng();
        let fresh = Id::between(None, None, 4, &mut rng);
        assert_eq!(fresh.site(), 4);
        assert_eq!(fresh.offset(), 0);
        assert!(!fresh.is_empty());
    }

    #[test]
    fn between_lands_between() {
        let mut rng = thread_rng();
        let low = id(&[100, 1, 0]);
        let high = id(&[200, 2, 0]);
        for _ in 0..64 {
            let mid = Id::between(Some(&low), Some(&high), 3, &mut rng);
            assert!(low < mid && mid < high, "{low:?} < {mid:?} < {high:?}");
            assert_eq!(mid.site(), 3);
            assert_eq!(mid.offset(), 0);
        }
    }

    #[test]
    fn between_adjacent_digits_descends() {
        let mut rng = thread_rng();
        // 5 and 6 leave no room at the first digit, so the result must keep
        // 5 as a prefix and descend.
        let low = id(&[5, 1, 9]);
        let high = id(&[6, 2, 0]);
        for _ in 0..64 {
            let mid = Id::between(Some(&low), Some(&high), 3, &mut rng);
            assert!(low < mid && mid < high, "{low:?} < {mid:?} < {high:?}");
        }
    }

    #[test]
    fn between_equal_neighbors_extends() {
        let mut rng = thread_rng();
        let a = id(&[5, 1, 9]);
        let mid = Id::between(Some(&a), Some(&a), 3, &mut rng);
        assert!(a < mid);
        assert_eq!(&mid.as_bytes()[..a.as_bytes().len()], a.as_bytes());
    }

    /// True when the open interval (low, high) contains no byte string at
    /// all: high extends low by a run of zero words, so nothing can sort
    /// between them.
    fn interval_is_empty(low: &Id, high: &Id) -> bool {
        let (lo, hi) = (low.as_bytes(), high.as_bytes());
        hi.len() > lo.len() && &hi[..lo.len()] == lo && hi[lo.len()..].iter().all(|b| *b == 0)
    }

    proptest! {
        #[test]
        fn between_is_strictly_between(
            lo_words in proptest::collection::vec(0u16..=u16::MAX, 3..8),
            hi_words in proptest::collection::vec(0u16..=u16::MAX, 3..8),
            site in 0u16..=u16::MAX,
        ) {
            let (a, b) = (id(&lo_words), id(&hi_words));
            prop_assume!(a != b);
            let (low, high) = if a < b { (a, b) } else { (b, a) };
            prop_assume!(!interval_is_empty(&low, &high));
            let mid = Id::between(Some(&low), Some(&high), site, &mut thread_rng());
            prop_assert!(low < mid);
            prop_assert!(mid < high);
        }

        #[test]
        fn between_above_low_neighbor_only(
            lo_words in proptest::collection::vec(0u16..=u16::MAX, 3..8),
            site in 0u16..=u16::MAX,
        ) {
            let low = id(&lo_words);
            let mid = Id::between(Some(&low), None, site, &mut thread_rng());
            prop_assert!(low < mid);
        }
    }
}
