use super::take_byte;
use crate::error::{DecodeError, Error, Result};
use smallvec::SmallVec;

/// Largest value a variable-length quantity can hold (28 bits).
pub const VARLEN_MAX: u32 = (1 << 28) - 1;

/// An encoded variable-length quantity: 1 to 4 bytes, stored inline.
pub type VarLen = SmallVec<[u8; 4]>;

/// Encodes `size` as big-endian 7-bit groups, continuation bit on all but the last byte.
pub fn encode_variable(size: u32) -> Result<VarLen> {
    if size > VARLEN_MAX {
        return Err(Error::VarlenOverflow(size));
    }
    let mut out = VarLen::new();
    let mut skipping = true;
    for i in (0..4).rev() {
        let group = ((size >> (i * 7)) & 0x7F) as u8;
        if skipping && group == 0 && i != 0 {
            continue;
        }
        skipping = false;
        out.push(if i == 0 { group } else { group | 0x80 });
    }
    Ok(out)
}

/// Reads a variable-length quantity off the front of `raw`.
///
/// On failure `raw` may be left in the middle of the quantity.
pub fn decode_variable(raw: &mut &[u8]) -> std::result::Result<u32, DecodeError> {
    let mut value = 0u32;
    for _ in 0..4 {
        let byte = take_byte(raw).ok_or(DecodeError::UnexpectedEof)?;
        value = (value << 7) | u32::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DecodeError::VarlenTooLong)
}

/// Appends `data` preceded by its varlen length.
pub(crate) fn write_varlen_slice(data: &[u8], out: &mut impl Extend<u8>) -> Result<()> {
    let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
    out.extend(encode_variable(len)?);
    out.extend(data.iter().copied());
    Ok(())
}

/// Reads a varlen length followed by that many bytes.
pub(crate) fn read_varlen_slice<'a>(
    raw: &mut &'a [u8],
) -> std::result::Result<&'a [u8], DecodeError> {
    let len = decode_variable(raw)? as usize;
    super::split_checked(raw, len).ok_or(DecodeError::UnexpectedEof)
}
