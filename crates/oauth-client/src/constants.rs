//! Protocol constants and defaults (RFC 7636, RFC 6749)

/// Shortest code verifier RFC 7636 §4.1 allows.
pub const MIN_VERIFIER_LENGTH: usize = 43;

/// Longest code verifier RFC 7636 §4.1 allows.
pub const MAX_VERIFIER_LENGTH: usize = 128;

/// Verifier length used when the caller has no preference.
pub const DEFAULT_VERIFIER_LENGTH: usize = MIN_VERIFIER_LENGTH;

/// Unreserved characters permitted in a code verifier.
pub const VERIFIER_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Random bytes behind each state and nonce value (256 bits).
pub const STATE_ENTROPY_BYTES: usize = 32;

/// Lifetime of an issued state value.
pub const DEFAULT_STATE_TTL_SECS: u64 = 600; // 10 minutes

/// How long expired or used state records linger before the sweeper drops
/// them. Keeps late replays reporting `Expired`/`AlreadyUsed` instead of
/// `NotFound`.
pub const DEFAULT_STATE_RETENTION_SECS: u64 = 60;
