use subtle::ConstantTimeEq;

/// Compares a presented secret with the configured one in constant time.
/// An unset secret never matches.
pub fn secret_matches(presented: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}
