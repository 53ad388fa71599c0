//! Content fingerprints for injection rules.
//!
//! A fingerprint is the first 64 bits of a SHA-256 digest taken over every
//! significant field of a rule, rendered as 16 lowercase hex digits.
//!
//! Fields are fed in a fixed order. Each one is tagged with its name and
//! terminated with [`SENTINEL`], so adjacent values cannot run together
//! (`["ab", "c"]` and `["a", "bc"]` hash differently). Maps are fed in
//! ascending key order and integers in big-endian form, which keeps the
//! result stable across restarts, platforms and YAML key ordering.
//!
//! Empty and absent fields feed nothing at all. Adding a new optional field
//! to a rule type therefore leaves the fingerprints of existing rules intact
//! as long as the field is left unset.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Byte appended after every field and every element of a list or map.
pub const SENTINEL: u8 = 0xFF;

/// Accumulates rule fields into a digest.
pub struct FingerprintHasher {
    digest: Sha256,
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            digest: Sha256::new(),
        }
    }

    fn tag(&mut self, name: &str) {
        self.digest.update(name.as_bytes());
        self.digest.update(b":");
    }

    fn end(&mut self) {
        self.digest.update([SENTINEL]);
    }

    /// Feed a string field. Empty strings are skipped.
    pub fn str(&mut self, name: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        self.tag(name);
        self.digest.update(value.as_bytes());
        self.end();
    }

    pub fn opt_str(&mut self, name: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.str(name, value);
        }
    }

    pub fn u32(&mut self, name: &str, value: u32) {
        self.tag(name);
        self.digest.update(value.to_be_bytes());
        self.end();
    }

    pub fn opt_i32(&mut self, name: &str, value: Option<i32>) {
        if let Some(value) = value {
            self.tag(name);
            self.digest.update(value.to_be_bytes());
            self.end();
        }
    }

    pub fn opt_i64(&mut self, name: &str, value: Option<i64>) {
        if let Some(value) = value {
            self.tag(name);
            self.digest.update(value.to_be_bytes());
            self.end();
        }
    }

    pub fn opt_bool(&mut self, name: &str, value: Option<bool>) {
        if let Some(value) = value {
            self.tag(name);
            self.digest.update([u8::from(value)]);
            self.end();
        }
    }

    /// Feed a list of strings, each element terminated separately.
    pub fn strings(&mut self, name: &str, values: &[String]) {
        if values.is_empty() {
            return;
        }
        self.tag(name);
        for value in values {
            self.digest.update(value.as_bytes());
            self.end();
        }
        self.end();
    }

    /// Feed a string map in ascending key order.
    pub fn map(&mut self, name: &str, values: &BTreeMap<String, String>) {
        if values.is_empty() {
            return;
        }
        self.tag(name);
        for (key, value) in values {
            self.str("key", key);
            self.str("value", value);
            self.end();
        }
        self.end();
    }

    pub fn nested<T: Fingerprint + ?Sized>(&mut self, name: &str, value: &T) {
        self.tag(name);
        value.feed(self);
        self.end();
    }

    pub fn opt_nested<T: Fingerprint>(&mut self, name: &str, value: Option<&T>) {
        if let Some(value) = value {
            self.nested(name, value);
        }
    }

    pub fn list<T: Fingerprint>(&mut self, name: &str, values: &[T]) {
        if values.is_empty() {
            return;
        }
        self.tag(name);
        for value in values {
            value.feed(self);
            self.end();
        }
        self.end();
    }

    /// Render the first eight digest bytes as 16 lowercase hex digits.
    pub fn finish(self) -> String {
        let digest = self.digest.finalize();
        let mut prefix = [0u8; 8];
        for (dst, src) in prefix.iter_mut().zip(digest.iter()) {
            *dst = *src;
        }
        format!("{:016x}", u64::from_be_bytes(prefix))
    }
}

/// Types that contribute their significant fields to a fingerprint.
pub trait Fingerprint {
    fn feed(&self, hasher: &mut FingerprintHasher);

    fn fingerprint(&self) -> String {
        let mut hasher = FingerprintHasher::new();
        self.feed(&mut hasher);
        hasher.finish()
    }
}
