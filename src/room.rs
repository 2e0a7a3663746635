//! Room codes: the short shared secret both peers present to the relay.

use rand::seq::SliceRandom;
use rand::thread_rng;

/// Code length in characters.
pub const ROOM_CODE_LEN: usize = 8;

/// Unambiguous uppercase alphanumerics: no 0/O, 1/I/L.
const ALPHABET: &[u8] = b"23456789ABCDEFGHJKMNPQRSTUVWXYZ";

/// Generate a fresh room code.
pub fn generate_room_code() -> String {
    let mut rng = thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| *ALPHABET.choose(&mut rng).unwrap_or(&b'2') as char)
        .collect()
}

/// Validate a room code before presenting it to the relay. Lowercase input
/// is accepted; the relay compares case-insensitively.
pub fn is_valid_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN
        && code
            .chars()
            .all(|c| ALPHABET.contains(&(c.to_ascii_uppercase() as u8)))
}

/// Canonical form used on the wire.
pub fn normalize_room_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
