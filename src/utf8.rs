//! UTF-8 validation for text payloads
//!
//! Dispatches to `simdutf8` (SSE4.2/AVX2/AVX-512 on x86_64, NEON on
//! aarch64, scalar elsewhere). Validation happens once per message, in the
//! cached text accessor; the ingress loop never validates mid-fragment.

/// Validate that the input is well-formed UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Checked conversion used by the text accessor
#[inline]
pub fn utf8_str(data: &[u8]) -> Option<&str> {
    if validate_utf8(data) {
        // SAFETY: validated just above
        Some(unsafe { std::str::from_utf8_unchecked(data) })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ascii_and_multibyte() {
        assert!(validate_utf8(b"Hello"));
        assert!(validate_utf8("héllo wörld ✓".as_bytes()));
        assert!(validate_utf8(b""));
    }

    #[test]
    fn rejects_truncated_sequences() {
        assert!(!validate_utf8(&[0xE2, 0x82]));
        assert!(!validate_utf8(&[0xFF]));
        assert_eq!(utf8_str(&[0xC0, 0x80]), None);
    }

    #[test]
    fn str_view_is_zero_copy() {
        let data = "payload".as_bytes();
        let s = utf8_str(data).unwrap();
        assert_eq!(s.as_ptr(), data.as_ptr());
    }
}
