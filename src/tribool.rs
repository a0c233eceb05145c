//! Three-valued logic used to combine handler predicates.

use std::ops;

/// A yes/no answer that may be undecided.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Default)]
pub enum Tribool {
    Yes,
    No,
    #[default]
    Unknown,
}

impl Tribool {
    #[inline]
    pub fn and(self, other: Tribool) -> Tribool {
        match (self, other) {
            (Tribool::No, _) | (_, Tribool::No) => Tribool::No,
            (Tribool::Yes, Tribool::Yes) => Tribool::Yes,
            _ => Tribool::Unknown,
        }
    }

    #[inline]
    pub fn or(self, other: Tribool) -> Tribool {
        match (self, other) {
            (Tribool::Yes, _) | (_, Tribool::Yes) => Tribool::Yes,
            (Tribool::No, Tribool::No) => Tribool::No,
            _ => Tribool::Unknown,
        }
    }

    /// Conjunction of every answer. An empty input is `Yes`.
    pub fn all<I: IntoIterator<Item = Tribool>>(answers: I) -> Tribool {
        let mut acc = Tribool::Yes;
        for answer in answers {
            acc = acc.and(answer);
            if acc == Tribool::No {
                break;
            }
        }
        acc
    }

    /// Disjunction of every answer. An empty input is `No`.
    pub fn any<I: IntoIterator<Item = Tribool>>(answers: I) -> Tribool {
        let mut acc = Tribool::No;
        for answer in answers {
            acc = acc.or(answer);
            if acc == Tribool::Yes {
                break;
            }
        }
        acc
    }

    #[inline]
    pub fn is_yes(self) -> bool {
        self == Tribool::Yes
    }

    #[inline]
    pub fn is_no(self) -> bool {
        self == Tribool::No
    }

    /// Collapses `Unknown` to `fallback`.
    #[inline]
    pub fn unwrap_or(self, fallback: bool) -> bool {
        match self {
            Tribool::Yes => true,
            Tribool::No => false,
            Tribool::Unknown => fallback,
        }
    }
}

impl From<bool> for Tribool {
    #[inline]
    fn from(value: bool) -> Self {
        if value { Tribool::Yes } else { Tribool::No }
    }
}

impl ops::Not for Tribool {
    type Output = Tribool;

    #[inline]
    fn not(self) -> Tribool {
        match self {
            Tribool::Yes => Tribool::No,
            Tribool::No => Tribool::Yes,
            Tribool::Unknown => Tribool::Unknown,
        }
    }
}
