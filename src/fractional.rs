//! Fractional ordering tokens.
//!
//! Folder nodes and edgeless elements are ordered by opaque strings compared
//! lexicographically. Appending generates a token strictly greater than the
//! current maximum; inserting between two tokens generates their midpoint.
//! Tokens stay opaque to callers; only their relative order is observable.

use rand::Rng;

/// Alphabet shared with the upstream's index generator. Lexicographic order
/// of the characters must match their order here.
const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const MIN_DIGIT: u8 = ALPHABET[0];
const MAX_DIGIT: u8 = ALPHABET[ALPHABET.len() - 1];

fn digit_index(digit: u8) -> usize {
    ALPHABET
        .iter()
        .position(|&c| c == digit)
        .unwrap_or(ALPHABET.len() / 2)
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..2)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// First token in an empty scope.
pub fn initial() -> String {
    "a0".to_owned()
}

/// A token strictly greater than `max`, for appending at the end of a scope.
///
/// Increments the last incrementable character; if every character is
/// already the greatest digit, extends the token instead so the result
/// still sorts after it.
pub fn after(max: &str) -> String {
    if max.is_empty() {
        return initial();
    }

    let bytes = max.as_bytes();
    for i in (0..bytes.len()).rev() {
        if bytes[i] < MAX_DIGIT {
            let next = ALPHABET[digit_index(bytes[i]) + 1];
            let mut out = bytes[..i].to_vec();
            out.push(next);
            return String::from_utf8(out).unwrap();
        }
    }

    let mut out = max.to_owned();
    out.push(ALPHABET[ALPHABET.len() / 2] as char);
    out
}

/// A token strictly between `lower` and `upper`.
///
/// Walks the common prefix, then picks the midpoint of the first differing
/// digits. When the two tokens are adjacent a random suffix breaks the tie,
/// keeping concurrent inserters unlikely to collide.
pub fn between(lower: &str, upper: &str) -> String {
    debug_assert!(lower < upper, "between() requires lower < upper");

    let lower_bytes = lower.as_bytes();
    let upper_bytes = upper.as_bytes();

    let mut prefix = Vec::new();
    let mut i = 0;
    loop {
        let lo = lower_bytes.get(i).copied().unwrap_or(MIN_DIGIT);
        let hi = upper_bytes.get(i).copied().unwrap_or(MAX_DIGIT);

        if lo == hi {
            prefix.push(lo);
            i += 1;
            continue;
        }

        let lo_idx = digit_index(lo);
        let hi_idx = digit_index(hi);
        if hi_idx - lo_idx > 1 {
            prefix.push(ALPHABET[(lo_idx + hi_idx) / 2]);
            return String::from_utf8(prefix).unwrap();
        }

        // Adjacent digits: keep the lower one and descend another level.
        prefix.push(lo);
        let rest = &lower_bytes[(i + 1).min(lower_bytes.len())..];
        let mut candidate = prefix.clone();
        candidate.extend_from_slice(rest);
        let mut token = after(std::str::from_utf8(&candidate).unwrap());
        if token.as_str() >= upper {
            token = String::from_utf8(prefix).unwrap();
            token.push(MAX_DIGIT as char);
        }
        token.push_str(&random_suffix());
        return token;
    }
}

/// A token greater than every element of `existing` (append semantics).
pub fn append_token<'a>(existing: impl Iterator<Item = &'a str>) -> String {
    match existing.max() {
        Some(max) => after(max),
        None => initial(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_token_is_stable() {
        assert_eq!(initial(), "a0");
    }

    #[test]
    fn after_is_strictly_greater() {
        let mut token = initial();
        for _ in 0..200 {
            let next = after(&token);
            assert!(next > token, "{next:?} must sort after {token:?}");
            token = next;
        }
    }

    #[test]
    fn after_saturated_token_extends() {
        let next = after("zz");
        assert!(next.as_str() > "zz");
        assert!(next.starts_with("zz"));
    }

    #[test]
    fn between_lands_inside_the_gap() {
        let cases = [("a0", "a4"), ("a0", "b0"), ("a0", "a1"), ("Zx", "a0")];
        for (lo, hi) in cases {
            let mid = between(lo, hi);
            assert!(
                mid.as_str() > lo && mid.as_str() < hi,
                "{mid:?} not between {lo:?} and {hi:?}"
            );
        }
    }

    #[test]
    fn between_adjacent_tokens_stays_ordered() {
        // Tight gaps force suffix generation; order must still hold.
        for _ in 0..50 {
            let mid = between("a0", "a01");
            assert!(mid.as_str() > "a0" && mid.as_str() < "a01", "{mid:?}");
        }
    }

    #[test]
    fn append_token_over_existing_set() {
        let existing = ["a0", "a2", "a1"];
        let token = append_token(existing.iter().copied());
        assert!(existing.iter().all(|t| token.as_str() > *t));
    }

    #[test]
    fn append_token_empty_scope() {
        assert_eq!(append_token(std::iter::empty()), "a0");
    }
}
