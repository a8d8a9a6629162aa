use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOrUid {
    Value(NonZeroU32),
    /// `*`, the largest number in use.
    Asterisk,
}

impl SeqOrUid {
    fn expand(&self, largest: u32) -> u32 {
        match self {
            Self::Value(v) => v.get(),
            Self::Asterisk => largest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    Single(SeqOrUid),
    Range(SeqOrUid, SeqOrUid),
}

/// A set of message sequence numbers or UIDs, as written by IMAP clients
/// (`1:4,7,10:*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSet(pub Vec<Sequence>);

impl SequenceSet {
    pub fn all() -> Self {
        Self(vec![Sequence::Range(
            SeqOrUid::Value(NonZeroU32::MIN),
            SeqOrUid::Asterisk,
        )])
    }

    /// Numbers designated by this set, ascending and deduplicated.
    /// `*` stands for `largest`; ranges are taken in either direction, and
    /// nothing above `largest` is returned, except an explicit value.
    pub fn iter(&self, largest: u32) -> impl Iterator<Item = u32> {
        let mut set = BTreeSet::new();
        for seq in self.0.iter() {
            match seq {
                Sequence::Single(x) => {
                    let v = x.expand(largest);
                    if v > 0 {
                        set.insert(v);
                    }
                }
                Sequence::Range(a, b) => {
                    let (a, b) = (a.expand(largest), b.expand(largest));
                    let (lo, hi) = (a.min(b).max(1), a.max(b).min(largest));
                    if lo <= hi {
                        set.extend(lo..=hi);
                    }
                }
            }
        }
        set.into_iter()
    }

    pub fn contains(&self, value: u32, largest: u32) -> bool {
        self.0.iter().any(|seq| match seq {
            Sequence::Single(x) => x.expand(largest) == value,
            Sequence::Range(a, b) => {
                let (a, b) = (a.expand(largest), b.expand(largest));
                a.min(b) <= value && value <= a.max(b)
            }
        })
    }
}

impl FromStr for SequenceSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        fn item(s: &str) -> Result<SeqOrUid, String> {
            if s == "*" {
                return Ok(SeqOrUid::Asterisk);
            }
            s.parse::<NonZeroU32>()
                .map(SeqOrUid::Value)
                .map_err(|_| format!("invalid sequence number {:?}", s))
        }

        let seqs = s
            .split(',')
            .map(|part| match part.split_once(':') {
                Some((a, b)) => Ok(Sequence::Range(item(a)?, item(b)?)),
                None => Ok(Sequence::Single(item(part)?)),
            })
            .collect::<Result<Vec<_>, String>>()?;
        Ok(Self(seqs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_expand() {
        let set: SequenceSet = "5:3,1,9:*".parse().unwrap();
        assert_eq!(set.iter(10).collect::<Vec<_>>(), vec![1, 3, 4, 5, 9, 10]);
        // `9:*` with a largest of 7 is `7:9`, clamped to 7
        assert_eq!(set.iter(7).collect::<Vec<_>>(), vec![1, 3, 4, 5, 7]);
        assert!(set.contains(4, 10));
        assert!(!set.contains(2, 10));

        assert!("0".parse::<SequenceSet>().is_err());
        assert!("1:".parse::<SequenceSet>().is_err());
        assert!("".parse::<SequenceSet>().is_err());
    }
}
