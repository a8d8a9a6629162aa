use crate::mail::record::MessageRecord;
use crate::mail::sequence::SequenceSet;
use crate::mail::uidindex::MailIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKey {
    All,
    /// Messages carrying this flag, system or keyword.
    Keyword(String),
    /// Messages without this flag.
    Unkeyword(String),
    /// Internal date strictly before, in milliseconds since the epoch.
    Before(u64),
    /// Internal date at or after, in milliseconds since the epoch.
    Since(u64),
    Larger(u64),
    Smaller(u64),
    /// Case insensitive substring of the named header field.
    Header(String, String),
    Subject(String),
    From(String),
    /// Substring of the whole raw message.
    Text(String),
    Uid(SequenceSet),
    SequenceSet(SequenceSet),
    Not(Box<SearchKey>),
    And(Vec<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
}

pub struct Criteria<'a>(pub &'a SearchKey);
impl<'a> Criteria<'a> {
    /// Splits `mails` between those we keep for sure and those that need
    /// their content to be fetched before a decision can be taken.
    /// Discarded mails are in neither list.
    pub fn filter_on_idx<'b>(
        &self,
        mails: &'b [MailIndex],
        exists: u32,
    ) -> (Vec<&'b MailIndex>, Vec<&'b MailIndex>) {
        let largest_uid = mails.last().map(|m| m.uid.get()).unwrap_or(0);
        let (p1, p2): (Vec<_>, Vec<_>) = mails
            .iter()
            .map(|x| (x, self.is_keep_on_idx(x, exists, largest_uid)))
            .filter(|(_midx, decision)| decision.is_keep())
            .partition(|(_midx, decision)| matches!(decision, PartialDecision::Keep));

        let to_keep = p1.into_iter().map(|(v, _)| v).collect();
        let to_fetch = p2.into_iter().map(|(v, _)| v).collect();
        (to_keep, to_fetch)
    }

    /// Everything but the message content is available in the index entry,
    /// so only `Text` has to be postponed.
    fn is_keep_on_idx(&self, midx: &MailIndex, exists: u32, largest_uid: u32) -> PartialDecision {
        use SearchKey::*;
        match self.0 {
            And(expr_list) => expr_list.iter().fold(PartialDecision::Keep, |acc, cur| {
                acc.and(&Criteria(cur).is_keep_on_idx(midx, exists, largest_uid))
            }),
            Or(left, right) => {
                let left_decision = Criteria(left).is_keep_on_idx(midx, exists, largest_uid);
                let right_decision = Criteria(right).is_keep_on_idx(midx, exists, largest_uid);
                left_decision.or(&right_decision)
            }
            Not(expr) => Criteria(expr)
                .is_keep_on_idx(midx, exists, largest_uid)
                .not(),
            Text(_) => PartialDecision::Postpone,
            _ => self
                .is_keep_on_meta(midx, exists, largest_uid, &midx.entry.record)
                .into(),
        }
    }

    /// Final decision, with the raw message at hand when it was needed.
    pub fn is_keep_on_query(
        &self,
        midx: &MailIndex,
        exists: u32,
        largest_uid: u32,
        content: Option<&[u8]>,
    ) -> bool {
        use SearchKey::*;
        match self.0 {
            And(expr_list) => expr_list
                .iter()
                .all(|cur| Criteria(cur).is_keep_on_query(midx, exists, largest_uid, content)),
            Or(left, right) => {
                Criteria(left).is_keep_on_query(midx, exists, largest_uid, content)
                    || Criteria(right).is_keep_on_query(midx, exists, largest_uid, content)
            }
            Not(expr) => !Criteria(expr).is_keep_on_query(midx, exists, largest_uid, content),
            Text(txt) => content
                .map(|raw| contains_ignore_case(raw, txt.as_bytes()))
                .unwrap_or(false),
            _ => self.is_keep_on_meta(midx, exists, largest_uid, &midx.entry.record),
        }
    }

    fn is_keep_on_meta(
        &self,
        midx: &MailIndex,
        exists: u32,
        largest_uid: u32,
        rec: &MessageRecord,
    ) -> bool {
        use SearchKey::*;
        match self.0 {
            All => true,
            Keyword(flag) => midx.is_flag_set(flag),
            Unkeyword(flag) => !midx.is_flag_set(flag),
            Uid(set) => set.contains(midx.uid.get(), largest_uid),
            SequenceSet(set) => set.contains(midx.i.get(), exists),
            Before(t) => rec.internal_date < *t,
            Since(t) => rec.internal_date >= *t,
            Larger(sz) => rec.size > *sz,
            Smaller(sz) => rec.size < *sz,
            Header(name, txt) => is_header_contains_pattern(rec, name.as_bytes(), txt.as_bytes()),
            Subject(txt) => is_header_contains_pattern(rec, b"subject", txt.as_bytes()),
            From(txt) => is_header_contains_pattern(rec, b"from", txt.as_bytes()),
            And(_) | Or(..) | Not(_) | Text(_) => {
                tracing::error!(key=?self.0, "combinator evaluated as a leaf");
                false
            }
        }
    }
}

fn is_header_contains_pattern(rec: &MessageRecord, name: &[u8], pattern: &[u8]) -> bool {
    rec.header_values(name)
        .iter()
        .any(|v| contains_ignore_case(v, pattern))
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack
        .windows(needle.len())
        .any(|win| win.eq_ignore_ascii_case(needle))
}

// --- Partial decision things ----

enum PartialDecision {
    Keep,
    Discard,
    Postpone,
}
impl From<bool> for PartialDecision {
    fn from(x: bool) -> Self {
        match x {
            true => PartialDecision::Keep,
            _ => PartialDecision::Discard,
        }
    }
}
impl PartialDecision {
    fn not(&self) -> Self {
        match self {
            Self::Keep => Self::Discard,
            Self::Discard => Self::Keep,
            Self::Postpone => Self::Postpone,
        }
    }

    fn or(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Keep, _) | (_, Self::Keep) => Self::Keep,
            (Self::Postpone, _) | (_, Self::Postpone) => Self::Postpone,
            (Self::Discard, Self::Discard) => Self::Discard,
        }
    }

    fn and(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Discard, _) | (_, Self::Discard) => Self::Discard,
            (Self::Postpone, _) | (_, Self::Postpone) => Self::Postpone,
            (Self::Keep, Self::Keep) => Self::Keep,
        }
    }

    fn is_keep(&self) -> bool {
        !matches!(self, Self::Discard)
    }
}
