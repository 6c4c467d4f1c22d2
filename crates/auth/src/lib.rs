use hex::ToHex;
use sha2::Digest;
use subtle::ConstantTimeEq;

/// Shape requirements for presented API keys.
#[derive(Debug, Clone, Copy)]
pub struct KeyPolicy {
    pub prefix_length: usize,
    pub min_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRejection {
    InvalidApiKey,
    ApiKeyRevoked,
}

impl KeyRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyRejection::InvalidApiKey => "INVALID_API_KEY",
            KeyRejection::ApiKeyRevoked => "API_KEY_REVOKED",
        }
    }
}

impl std::fmt::Display for KeyRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::error::Error for KeyRejection {}

/// A stored key row fetched by prefix; the raw secret is never persisted.
#[derive(Debug, Clone)]
pub struct CandidateKey {
    pub id: String,
    pub env_id: String,
    pub key_hash: String,
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedKey {
    pub id: String,
    pub env_id: String,
}

/// Hex SHA-256 of a secret; the only form a key ever takes at rest.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().encode_hex::<String>()
}

/// The leading portion of the presented key used for the indexed lookup.
/// `None` when the key is too short or the prefix is not printable ASCII.
pub fn key_prefix<'a>(presented: &'a str, policy: &KeyPolicy) -> Option<&'a str> {
    if presented.len() < policy.min_length || presented.len() < policy.prefix_length {
        return None;
    }
    let prefix = presented.get(..policy.prefix_length)?;
    if !prefix.bytes().all(|b| b.is_ascii_graphic()) {
        return None;
    }
    Some(prefix)
}

fn decode_digest(hash_hex: &str) -> [u8; 32] {
    // A stored hash that is not valid 64-char hex can never equal a real
    // digest; comparing against zeros keeps the work per candidate constant.
    hex::decode(hash_hex)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .unwrap_or([0u8; 32])
}

/// Compare the presented secret against every candidate with a
/// length-independent constant-time digest comparison. All candidates are
/// examined even after a match so timing does not reveal the matching row.
pub fn verify_key(
    presented: &str,
    candidates: &[CandidateKey],
    policy: &KeyPolicy,
) -> Result<VerifiedKey, KeyRejection> {
    if presented.len() < policy.min_length {
        return Err(KeyRejection::InvalidApiKey);
    }

    let mut hasher = sha2::Sha256::new();
    hasher.update(presented.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();

    let mut matched: Option<&CandidateKey> = None;
    for candidate in candidates {
        let stored = decode_digest(&candidate.key_hash);
        if bool::from(digest.ct_eq(&stored)) && matched.is_none() {
            matched = Some(candidate);
        }
    }

    match matched {
        Some(candidate) if candidate.revoked => Err(KeyRejection::ApiKeyRevoked),
        Some(candidate) => Ok(VerifiedKey {
            id: candidate.id.clone(),
            env_id: candidate.env_id.clone(),
        }),
        None => Err(KeyRejection::InvalidApiKey),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: KeyPolicy = KeyPolicy {
        prefix_length: 8,
        min_length: 24,
    };

    fn candidate(id: &str, secret: &str, revoked: bool) -> CandidateKey {
        CandidateKey {
            id: id.to_string(),
            env_id: "env_1".to_string(),
            key_hash: hash_secret(secret),
            revoked,
        }
    }

    #[test]
    fn prefix_is_the_leading_printable_chars() {
        let secret = "wk_test_9f8e7d6c5b4a39281706";
        assert_eq!(key_prefix(secret, &POLICY), Some("wk_test_"));
    }

    #[test]
    fn short_keys_have_no_prefix() {
        assert_eq!(key_prefix("short", &POLICY), None);
    }

    #[test]
    fn matching_secret_verifies() {
        let secret = "wk_test_9f8e7d6c5b4a39281706";
        let candidates = vec![
            candidate("k1", "wk_test_other_secret_value_1", false),
            candidate("k2", secret, false),
        ];

        let verified = verify_key(secret, &candidates, &POLICY).expect("key should verify");
        assert_eq!(verified.id, "k2");
        assert_eq!(verified.env_id, "env_1");
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let candidates = vec![candidate("k1", "wk_test_other_secret_value_1", false)];
        let err = verify_key("wk_test_9f8e7d6c5b4a39281706", &candidates, &POLICY).unwrap_err();
        assert_eq!(err, KeyRejection::InvalidApiKey);
        assert_eq!(err.as_str(), "INVALID_API_KEY");
    }

    #[test]
    fn revoked_match_is_reported_as_revoked() {
        let secret = "wk_test_9f8e7d6c5b4a39281706";
        let candidates = vec![candidate("k1", secret, true)];
        let err = verify_key(secret, &candidates, &POLICY).unwrap_err();
        assert_eq!(err, KeyRejection::ApiKeyRevoked);
    }

    #[test]
    fn too_short_presented_key_is_invalid() {
        let candidates = vec![candidate("k1", "wk_test_9f8e7d6c5b4a39281706", false)];
        let err = verify_key("tiny", &candidates, &POLICY).unwrap_err();
        assert_eq!(err, KeyRejection::InvalidApiKey);
    }

    #[test]
    fn corrupt_stored_hash_never_matches() {
        let mut bad = candidate("k1", "wk_test_9f8e7d6c5b4a39281706", false);
        bad.key_hash = "not-hex".to_string();
        let err = verify_key("wk_test_9f8e7d6c5b4a39281706", &[bad], &POLICY).unwrap_err();
        assert_eq!(err, KeyRejection::InvalidApiKey);
    }
}
