//! Cache key derivation.

use std::collections::BTreeMap;
use std::fmt;

use kiln_common::Digest;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

const KEY_DOMAIN: &[u8] = b"kiln-cache-key/v1";
const LINEAGE_DOMAIN: &[u8] = b"kiln-lineage/v1";

/// Composite key identifying one instruction's layer in one lineage.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Digest);

impl CacheKey {
    /// Derive a key from the parent lineage digest, the instruction text,
    /// the build arguments and the base image digest.
    ///
    /// The instruction text is normalized first, and only build arguments
    /// the text references take part. Each field is length-prefixed so no
    /// two distinct inputs hash the same byte stream.
    #[must_use]
    pub fn derive(
        parent: &Digest,
        instruction: &str,
        build_args: &BTreeMap<String, String>,
        base: &Digest,
    ) -> Self {
        let text = normalize_instruction(instruction);
        let args = referenced_args(&text, build_args);

        let mut hasher = Sha256::new();
        field(&mut hasher, KEY_DOMAIN);
        field(&mut hasher, parent.as_str().as_bytes());
        field(&mut hasher, text.as_bytes());
        hasher.update((args.len() as u64).to_be_bytes());
        for (name, value) in &args {
            field(&mut hasher, name.as_bytes());
            match value {
                Some(value) => {
                    hasher.update([1]);
                    field(&mut hasher, value.as_bytes());
                }
                None => hasher.update([0]),
            }
        }
        field(&mut hasher, base.as_str().as_bytes());

        Self(Digest::from_hasher(hasher))
    }

    /// Lineage digest after the instruction this key describes produced
    /// `layer`; the parent for the next instruction's key.
    ///
    /// Folding the key in (not just the layer digest) makes instructions
    /// that produce the same layer, such as two config-only instructions
    /// with different values, still lead to different downstream keys.
    #[must_use]
    pub fn lineage(&self, layer: &Digest) -> Digest {
        let mut hasher = Sha256::new();
        field(&mut hasher, LINEAGE_DOMAIN);
        field(&mut hasher, self.0.as_str().as_bytes());
        field(&mut hasher, layer.as_str().as_bytes());
        Digest::from_hasher(hasher)
    }

    /// Wrap an existing digest, e.g. one read back from a backend.
    #[must_use]
    pub const fn from_digest(digest: Digest) -> Self {
        Self(digest)
    }

    /// The key as a digest.
    #[must_use]
    pub const fn digest(&self) -> &Digest {
        &self.0
    }

    /// Hex part of the key, used for file and object names.
    #[must_use]
    pub fn hex(&self) -> &str {
        self.0.hex()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.0)
    }
}

fn field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Trim and collapse whitespace runs outside quotes to a single space.
///
/// Quoted text (single or double quotes) is kept verbatim, as is any
/// character escaped with a backslash outside single quotes.
#[must_use]
pub fn normalize_instruction(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut pending_space = false;

    for c in text.trim().chars() {
        if escaped {
            out.push(c);
            escaped = false;
            continue;
        }
        match quote {
            Some(q) => {
                if c == '\\' && q == '"' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                out.push(c);
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                match c {
                    '\\' => escaped = true,
                    '"' | '\'' => quote = Some(c),
                    _ => {}
                }
                out.push(c);
            }
        }
    }
    out
}

/// Build arguments referenced by `text` as `$NAME` or `${NAME}`, sorted by
/// name. A referenced argument with no value is recorded as `None`.
#[must_use]
pub fn referenced_args(text: &str, args: &BTreeMap<String, String>) -> BTreeMap<String, Option<String>> {
    let mut found = BTreeMap::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let braced = bytes.get(i + 1) == Some(&b'{');
        let start = if braced { i + 2 } else { i + 1 };
        let end = start
            + bytes[start.min(bytes.len())..]
                .iter()
                .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
                .count();
        let valid = end > start
            && !bytes[start].is_ascii_digit()
            && (!braced || bytes.get(end) == Some(&b'}'));
        if valid {
            let name = &text[start..end];
            found
                .entry(name.to_string())
                .or_insert_with(|| args.get(name).cloned());
        }
        i = end.max(i + 1);
    }
    found
}
