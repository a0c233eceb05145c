use std::fmt;
use std::ops::Deref;

/// A borrowed, contiguous run of bytes.
///
/// Views never copy and never own: the borrow checker ties every view to its source, so a view
/// over a temporary buffer cannot outlive the statement that created it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ByteView<'a> {
    bytes: &'a [u8],
}

/// Wraps anything that exposes its bytes (`&str`, `&[u8]`, `&Vec<u8>`, arrays).
#[inline]
pub fn make_view<'a, S>(source: &'a S) -> ByteView<'a>
where
    S: AsRef<[u8]> + ?Sized,
{
    ByteView {
        bytes: source.as_ref(),
    }
}

impl<'a> ByteView<'a> {
    #[inline]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// The underlying slice, with the source's lifetime rather than the view's.
    #[inline]
    pub fn as_slice(&self) -> &'a [u8] {
        self.bytes
    }

    /// A sub-view, or `None` when the range is out of bounds.
    pub fn slice(&self, start: usize, len: usize) -> Option<ByteView<'a>> {
        let end = start.checked_add(len)?;
        self.bytes.get(start..end).map(ByteView::new)
    }
}

impl Deref for ByteView<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl AsRef<[u8]> for ByteView<'_> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.bytes
    }
}

impl<'a> From<&'a [u8]> for ByteView<'a> {
    #[inline]
    fn from(bytes: &'a [u8]) -> Self {
        Self::new(bytes)
    }
}

impl<'a> From<&'a str> for ByteView<'a> {
    #[inline]
    fn from(text: &'a str) -> Self {
        Self::new(text.as_bytes())
    }
}

impl fmt::Debug for ByteView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X?}", self.bytes)
    }
}
