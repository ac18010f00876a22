//! Common helper functions for Sealgram.

/// Performs a constant-time comparison of two byte strings.
/// Used when comparing key material so the comparison time does not leak
/// how many leading bytes matched.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq_identical() {
        assert!(constant_time_eq(b"foobar", b"foobar"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_constant_time_eq_different() {
        assert!(!constant_time_eq(b"foobar", b"foobaz"));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn test_constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"much_longer_key"));
        assert!(!constant_time_eq(b"a", b""));
    }
}
