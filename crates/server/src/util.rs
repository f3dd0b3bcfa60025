use blake3::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};

/// Encodes raw bytes into hexadecimal representation.
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        output.push(nibble(byte >> 4));
        output.push(nibble(byte & 0x0f));
    }
    output
}

/// Generates an opaque identifier from entropy and context.
pub fn generate_id(context: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(context.as_bytes());
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_le_bytes();
    hasher.update(&now);
    encode_hex(hasher.finalize().as_bytes())
}

/// Digest of a bearer token as stored in the session table.
pub fn token_digest(token: &str) -> String {
    encode_hex(blake3::hash(token.as_bytes()).as_bytes())
}

fn nibble(value: u8) -> char {
    match value {
        0..=9 => (b'0' + value) as char,
        _ => (b'a' + value - 10) as char,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encoding() {
        assert_eq!(encode_hex(&[0x00, 0xff, 0x1a]), "00ff1a");
    }

    #[test]
    fn generated_ids_are_unique() {
        let first = generate_id("call:alice:bob");
        let second = generate_id("call:alice:bob");
        assert_eq!(first.len(), 64);
        assert_ne!(first, second);
    }

    #[test]
    fn token_digest_is_stable() {
        assert_eq!(token_digest("secret"), token_digest("secret"));
        assert_ne!(token_digest("secret"), token_digest("other"));
    }
}
