//! Raw byte views and the MIDI variable-length quantity.

mod varlen;
mod view;

pub use varlen::{VARLEN_MAX, VarLen, decode_variable, encode_variable};
pub(crate) use varlen::{read_varlen_slice, write_varlen_slice};
pub use view::{ByteView, make_view};

/// Splits `at` bytes off the front of `raw`, or returns `None` when there are not enough.
pub(crate) fn split_checked<'a>(raw: &mut &'a [u8], at: usize) -> Option<&'a [u8]> {
    if at > raw.len() {
        None
    } else {
        let (extracted, remainder) = raw.split_at(at);
        *raw = remainder;
        Some(extracted)
    }
}

/// Pops the first byte off `raw`.
pub(crate) fn take_byte(raw: &mut &[u8]) -> Option<u8> {
    let (&first, rest) = raw.split_first()?;
    *raw = rest;
    Some(first)
}
