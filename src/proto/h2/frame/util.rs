use bytes::Bytes;

use super::Error;

/// Strips the pad-length octet and trailing padding from a padded payload.
pub(super) fn strip_padding(payload: &mut Bytes) -> Result<(), Error> {
    if payload.is_empty() {
        return Err(Error::TooMuchPadding);
    }
    let pad_len = payload[0] as usize;
    if pad_len >= payload.len() {
        return Err(Error::TooMuchPadding);
    }
    let _ = payload.split_to(1);
    payload.truncate(payload.len() - pad_len);
    Ok(())
}
