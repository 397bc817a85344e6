//! Opaque entity identifiers.
//!
//! Every id is `<prefix>_<base32>` where the prefix names the entity kind
//! and the suffix is 26 characters of random Crockford-style base32
//! (lowercase, no `i`/`l`/`o`/`u`). Ids are generated client-side so that
//! rows can be inserted with their final id in one statement.

use rand::Rng;

/// Entity kind prefixes.
pub mod prefix {
    pub const WORKFLOW: &str = "wf";
    pub const TASK: &str = "tk";
    pub const CHECKPOINT: &str = "cp";
    pub const MESSAGE: &str = "msg";
    pub const AGENT: &str = "ag";
    pub const WORKSPACE: &str = "ws";
    pub const REPOSITORY: &str = "rp";
    pub const TEMPLATE: &str = "tmpl";
    pub const SESSION: &str = "sp";
}

const ALPHABET: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";
const SUFFIX_LEN: usize = 26;

/// Generate a fresh id for the given entity prefix.
pub fn generate(prefix: &str) -> String {
    let mut rng = rand::rng();
    let mut out = String::with_capacity(prefix.len() + 1 + SUFFIX_LEN);
    out.push_str(prefix);
    out.push('_');
    for _ in 0..SUFFIX_LEN {
        let idx = rng.random_range(0..ALPHABET.len());
        out.push(ALPHABET[idx] as char);
    }
    out
}

/// Check that an id carries the expected prefix.
pub fn has_prefix(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|suffix| !suffix.is_empty())
}
