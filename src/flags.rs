//! Type-safe bit sets over small closed enumerations.
//!
//! A [`Flags<E>`] stores a set of symbolic values of `E` in a fixed-width integer chosen by the
//! enumeration itself. Every categorical, multi-valued attribute in the crate (handler modes and
//! states, MIDI channel sets, event families) is one of these.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops;
use std::sync::atomic::{AtomicU64, Ordering};

/// Backing integer of a flag set.
pub trait Bits:
    Copy
    + Eq
    + Hash
    + Default
    + fmt::Debug
    + ops::BitOr<Output = Self>
    + ops::BitAnd<Output = Self>
    + ops::BitXor<Output = Self>
    + ops::Not<Output = Self>
    + Send
    + Sync
    + 'static
{
    const WIDTH: u32;
    const ZERO: Self;

    /// Single bit at `index`, or zero when the index is out of range.
    fn bit(index: u32) -> Self;
    fn to_u64(self) -> u64;
    /// Truncating conversion.
    fn from_u64(raw: u64) -> Self;
}

macro_rules! impl_bits {
    ($($int:ty),*) => {
        $(
            impl Bits for $int {
                const WIDTH: u32 = <$int>::BITS;
                const ZERO: Self = 0;

                #[inline]
                fn bit(index: u32) -> Self {
                    (1 as $int).checked_shl(index).unwrap_or(0)
                }
                #[inline]
                fn to_u64(self) -> u64 {
                    self as u64
                }
                #[inline]
                fn from_u64(raw: u64) -> Self {
                    raw as $int
                }
            }
        )*
    };
}
impl_bits!(u8, u16, u32, u64);

/// An enumeration of named bit positions.
pub trait FlagEnum: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    type Bits: Bits;

    /// Bit index of this value.
    fn index(self) -> u32;

    /// Symbolic value at `index`, if there is one.
    fn from_index(index: u32) -> Option<Self>;
}

/// A set of values of `E`.
pub struct Flags<E: FlagEnum> {
    bits: E::Bits,
    _marker: PhantomData<E>,
}

impl<E: FlagEnum> Flags<E> {
    #[inline]
    pub fn empty() -> Self {
        Self::from_integral(E::Bits::ZERO)
    }

    /// Every bit of the backing integer, including bits with no symbolic meaning.
    #[inline]
    pub fn full() -> Self {
        Self::from_integral(!E::Bits::ZERO)
    }

    #[inline]
    pub fn wrap(value: E) -> Self {
        Self::from_integral(E::Bits::bit(value.index()))
    }

    /// Union of several values or flag sets.
    pub fn fuse<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Self>,
    {
        items
            .into_iter()
            .fold(Self::empty(), |acc, item| acc | item.into())
    }

    /// Reinterprets a raw integer. Bits without a symbolic value are kept as-is.
    #[inline]
    pub const fn from_integral(bits: E::Bits) -> Self {
        Self {
            bits,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn to_integral(self) -> E::Bits {
        self.bits
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.bits == E::Bits::ZERO
    }

    #[inline]
    pub fn test(self, value: E) -> bool {
        self.any(Self::wrap(value))
    }

    /// True if the sets intersect.
    #[inline]
    pub fn any(self, other: impl Into<Self>) -> bool {
        (self.bits & other.into().bits) != E::Bits::ZERO
    }

    /// True if `self` is a superset of `other`.
    #[inline]
    pub fn all(self, other: impl Into<Self>) -> bool {
        let other = other.into();
        (self.bits & other.bits) == other.bits
    }

    /// True if the sets are disjoint.
    #[inline]
    pub fn none(self, other: impl Into<Self>) -> bool {
        !self.any(other)
    }

    /// Sets `mask` when `on`, clears it otherwise.
    #[inline]
    pub fn commute(self, mask: impl Into<Self>, on: bool) -> Self {
        if on { self | mask } else { self & !mask.into() }
    }

    /// Number of set bits, symbolic or not.
    #[inline]
    pub fn len(self) -> usize {
        self.bits.to_u64().count_ones() as usize
    }

    /// Set values in ascending bit order.
    #[inline]
    pub fn iter(self) -> FlagsIter<E> {
        FlagsIter {
            bits: self.bits.to_u64(),
            index: 0,
            _marker: PhantomData,
        }
    }

    /// Lowest set value.
    #[inline]
    pub fn first(self) -> Option<E> {
        self.iter().next()
    }
}

impl<E: FlagEnum> Clone for Flags<E> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}
impl<E: FlagEnum> Copy for Flags<E> {}

impl<E: FlagEnum> PartialEq for Flags<E> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}
impl<E: FlagEnum> Eq for Flags<E> {}

impl<E: FlagEnum> Hash for Flags<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits.hash(state)
    }
}

impl<E: FlagEnum> Default for Flags<E> {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

impl<E: FlagEnum> fmt::Debug for Flags<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<E: FlagEnum> From<E> for Flags<E> {
    #[inline]
    fn from(value: E) -> Self {
        Self::wrap(value)
    }
}

impl<E: FlagEnum> FromIterator<E> for Flags<E> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self::fuse(iter)
    }
}

impl<E: FlagEnum> IntoIterator for Flags<E> {
    type Item = E;
    type IntoIter = FlagsIter<E>;

    #[inline]
    fn into_iter(self) -> FlagsIter<E> {
        self.iter()
    }
}

macro_rules! impl_binary_op {
    ($op:ident, $method:ident, $assign:ident, $assign_method:ident, $tok:tt) => {
        impl<E: FlagEnum, R: Into<Flags<E>>> ops::$op<R> for Flags<E> {
            type Output = Flags<E>;

            #[inline]
            fn $method(self, rhs: R) -> Flags<E> {
                Flags::from_integral(self.bits $tok rhs.into().bits)
            }
        }
        impl<E: FlagEnum, R: Into<Flags<E>>> ops::$assign<R> for Flags<E> {
            #[inline]
            fn $assign_method(&mut self, rhs: R) {
                self.bits = self.bits $tok rhs.into().bits;
            }
        }
    };
}
impl_binary_op!(BitOr, bitor, BitOrAssign, bitor_assign, |);
impl_binary_op!(BitAnd, bitand, BitAndAssign, bitand_assign, &);
impl_binary_op!(BitXor, bitxor, BitXorAssign, bitxor_assign, ^);

impl<E: FlagEnum> ops::Not for Flags<E> {
    type Output = Flags<E>;

    #[inline]
    fn not(self) -> Flags<E> {
        Flags::from_integral(!self.bits)
    }
}

/// Iterator over the symbolic values of a flag set.
///
/// Cloning restarts nothing: a clone continues from the same position, and a fresh iterator can
/// always be obtained from the (copyable) set again.
pub struct FlagsIter<E> {
    bits: u64,
    index: u32,
    _marker: PhantomData<E>,
}

impl<E> Clone for FlagsIter<E> {
    fn clone(&self) -> Self {
        Self {
            bits: self.bits,
            index: self.index,
            _marker: PhantomData,
        }
    }
}

impl<E: FlagEnum> Iterator for FlagsIter<E> {
    type Item = E;

    fn next(&mut self) -> Option<E> {
        while self.index < E::Bits::WIDTH {
            let index = self.index;
            self.index += 1;
            if self.bits & (1u64 << index) != 0 {
                if let Some(value) = E::from_index(index) {
                    return Some(value);
                }
            }
        }
        None
    }
}

/// A flag set that can be updated from several threads.
pub struct AtomicFlags<E: FlagEnum> {
    bits: AtomicU64,
    _marker: PhantomData<E>,
}

impl<E: FlagEnum> AtomicFlags<E> {
    pub fn new(flags: Flags<E>) -> Self {
        Self {
            bits: AtomicU64::new(flags.bits.to_u64()),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self) -> Flags<E> {
        Flags::from_integral(E::Bits::from_u64(self.bits.load(Ordering::Acquire)))
    }

    #[inline]
    pub fn store(&self, flags: Flags<E>) {
        self.bits.store(flags.bits.to_u64(), Ordering::Release);
    }

    /// Sets `mask`, returning the previous value.
    #[inline]
    pub fn fetch_or(&self, mask: impl Into<Flags<E>>) -> Flags<E> {
        let mask = mask.into().bits.to_u64();
        Flags::from_integral(E::Bits::from_u64(self.bits.fetch_or(mask, Ordering::AcqRel)))
    }

    /// Clears `mask`, returning the previous value.
    #[inline]
    pub fn fetch_and_not(&self, mask: impl Into<Flags<E>>) -> Flags<E> {
        let mask = mask.into().bits.to_u64();
        Flags::from_integral(E::Bits::from_u64(
            self.bits.fetch_and(!mask, Ordering::AcqRel),
        ))
    }

    /// Sets or clears `mask`, returning the previous value.
    #[inline]
    pub fn commute(&self, mask: impl Into<Flags<E>>, on: bool) -> Flags<E> {
        if on {
            self.fetch_or(mask)
        } else {
            self.fetch_and_not(mask)
        }
    }
}

impl<E: FlagEnum> Default for AtomicFlags<E> {
    fn default() -> Self {
        Self::new(Flags::empty())
    }
}

impl<E: FlagEnum> fmt::Debug for AtomicFlags<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}
