//! Canonical request fingerprints.
//!
//! A fingerprint is a SHA-256 digest over a framed byte encoding of the
//! request identity: model id, request kind, prompt (or ordered message
//! list), and the sampling parameters that influence the output. The
//! encoding is built so that equivalent requests collapse to one key:
//!
//! - stop sequences are sorted before hashing, so their order is irrelevant;
//! - callers fill unset optional parameters with the documented defaults
//!   before building a [`SamplingKey`], so "unset" and "explicit default"
//!   hash identically;
//! - an opt-in flag trims trailing whitespace from prompts.
//!
//! Every variable-length field is length-prefixed, so no two distinct
//! requests can serialize to the same byte string.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Canonical hash of a generation request. Stable across process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hex digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix is enough for log correlation.
        write!(f, "{}", &self.0[..16.min(self.0.len())])
    }
}

/// The sampling parameters that participate in cache identity.
///
/// Construct this with all defaults already applied; [`SamplingKey::default`]
/// carries the gateway's documented canonical values.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingKey {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub stop: Vec<String>,
    pub seed: Option<u64>,
}

impl Default for SamplingKey {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            stop: Vec::new(),
            seed: None,
        }
    }
}

/// Fingerprint a plain-prompt completion request.
pub fn completion_fingerprint(
    model: &str,
    prompt: &str,
    sampling: &SamplingKey,
    trim_trailing_whitespace: bool,
) -> Fingerprint {
    let mut hasher = FrameHasher::new("completion", model);
    let prompt = if trim_trailing_whitespace {
        prompt.trim_end()
    } else {
        prompt
    };
    hasher.frame("prompt", prompt.as_bytes());
    hasher.sampling(sampling);
    hasher.finish()
}

/// Fingerprint a chat request. Message order is significant; role and
/// content are framed separately so `(a, bc)` and `(ab, c)` differ.
pub fn chat_fingerprint(
    model: &str,
    messages: &[(String, String)],
    sampling: &SamplingKey,
) -> Fingerprint {
    let mut hasher = FrameHasher::new("chat", model);
    hasher.frame("n_messages", messages.len().to_string().as_bytes());
    for (role, content) in messages {
        hasher.frame("role", role.as_bytes());
        hasher.frame("content", content.as_bytes());
    }
    hasher.sampling(sampling);
    hasher.finish()
}

/// Incrementally hashes length-prefixed `name=value` frames.
struct FrameHasher {
    hasher: Sha256,
}

impl FrameHasher {
    fn new(kind: &str, model: &str) -> Self {
        let mut this = Self {
            hasher: Sha256::new(),
        };
        this.frame("kind", kind.as_bytes());
        this.frame("model", model.as_bytes());
        this
    }

    fn frame(&mut self, name: &str, value: &[u8]) {
        self.hasher.update(name.as_bytes());
        self.hasher.update([0x1f]);
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
        self.hasher.update([0x1e]);
    }

    fn sampling(&mut self, s: &SamplingKey) {
        self.frame("max_tokens", s.max_tokens.to_string().as_bytes());
        // Float Display is stable for a given value; bit-identical inputs
        // produce identical text.
        self.frame("temperature", s.temperature.to_string().as_bytes());
        self.frame("top_p", s.top_p.to_string().as_bytes());
        self.frame("top_k", s.top_k.to_string().as_bytes());
        self.frame("repeat_penalty", s.repeat_penalty.to_string().as_bytes());
        let mut stop = s.stop.clone();
        stop.sort();
        self.frame("n_stop", stop.len().to_string().as_bytes());
        for st in &stop {
            self.frame("stop", st.as_bytes());
        }
        match s.seed {
            Some(seed) => self.frame("seed", seed.to_string().as_bytes()),
            None => self.frame("seed", b"none"),
        }
    }

    fn finish(self) -> Fingerprint {
        let digest = self.hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(hex, "{byte:02x}");
        }
        Fingerprint(hex)
    }
}
