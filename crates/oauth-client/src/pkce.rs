//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! The verifier stays with the flow and is only sent during token exchange;
//! the challenge travels in the authorization URL. `S256` is the default.
//! `plain` exists so a flow can deliberately demonstrate a downgraded PKCE.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::constants::{
    DEFAULT_VERIFIER_LENGTH, MAX_VERIFIER_LENGTH, MIN_VERIFIER_LENGTH, VERIFIER_ALPHABET,
};
use crate::error::{Error, Result};

/// `code_challenge_method` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChallengeMethod {
    #[default]
    S256,
    #[serde(rename = "plain")]
    Plain,
}

impl ChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeMethod::S256 => "S256",
            ChallengeMethod::Plain => "plain",
        }
    }
}

impl fmt::Display for ChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "S256" => Ok(ChallengeMethod::S256),
            "plain" => Ok(ChallengeMethod::Plain),
            other => Err(format!("unknown code_challenge_method: {other}")),
        }
    }
}

/// Verifier + derived challenge. Immutable once built; the challenge can only
/// come from `compute_challenge` over the verifier.
#[derive(Clone)]
pub struct PkcePair {
    verifier: Secret<String>,
    challenge: String,
    method: ChallengeMethod,
}

impl PkcePair {
    /// Generate a fresh pair with a verifier of `length` characters.
    pub fn generate(length: usize, method: ChallengeMethod) -> Result<Self> {
        check_length(length)?;
        let verifier = random_verifier(length);
        let challenge = compute_challenge(&verifier, method);
        Ok(Self {
            verifier: Secret::new(verifier),
            challenge,
            method,
        })
    }

    /// Generate with the default length (43) and `S256`.
    pub fn generate_default() -> Self {
        let verifier = random_verifier(DEFAULT_VERIFIER_LENGTH);
        let challenge = compute_challenge(&verifier, ChallengeMethod::S256);
        Self {
            verifier: Secret::new(verifier),
            challenge,
            method: ChallengeMethod::S256,
        }
    }

    /// Rebuild a pair around an existing verifier.
    pub fn from_verifier(verifier: String, method: ChallengeMethod) -> Result<Self> {
        check_length(verifier.len())?;
        if !verifier.bytes().all(|b| VERIFIER_ALPHABET.contains(&b)) {
            return Err(Error::InvalidVerifier);
        }
        let challenge = compute_challenge(&verifier, method);
        Ok(Self {
            verifier: Secret::new(verifier),
            challenge,
            method,
        })
    }

    pub fn verifier(&self) -> &Secret<String> {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn method(&self) -> ChallengeMethod {
        self.method
    }
}

impl fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkcePair")
            .field("verifier", &self.verifier)
            .field("challenge", &self.challenge)
            .field("method", &self.method)
            .finish()
    }
}

/// Derive the challenge for `verifier`.
///
/// `S256`: `BASE64URL(SHA256(verifier))`, no padding. `plain`: the verifier.
pub fn compute_challenge(verifier: &str, method: ChallengeMethod) -> String {
    match method {
        ChallengeMethod::S256 => URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())),
        ChallengeMethod::Plain => verifier.to_owned(),
    }
}

/// Check a verifier against a challenge. Pure, constant time in the length of
/// the challenge.
pub fn verify(verifier: &str, challenge: &str, method: ChallengeMethod) -> bool {
    let expected = compute_challenge(verifier, method);
    expected.as_bytes().ct_eq(challenge.as_bytes()).into()
}

fn check_length(length: usize) -> Result<()> {
    if (MIN_VERIFIER_LENGTH..=MAX_VERIFIER_LENGTH).contains(&length) {
        Ok(())
    } else {
        Err(Error::InvalidLength(length))
    }
}

/// Draw `length` characters uniformly from the unreserved alphabet.
///
/// Bytes at or above the largest multiple of the alphabet size are rejected so
/// that the modulo does not bias towards the first characters.
fn random_verifier(length: usize) -> String {
    let alphabet_len = VERIFIER_ALPHABET.len();
    let limit = (256 / alphabet_len) * alphabet_len;
    let mut out = String::with_capacity(length);
    let mut rng = rand::rng();
    let mut buf = [0u8; 64];

    while out.len() < length {
        rng.fill(&mut buf);
        for &b in buf.iter() {
            if (b as usize) < limit {
                out.push(VERIFIER_ALPHABET[b as usize % alphabet_len] as char);
                if out.len() == length {
                    break;
                }
            }
        }
    }
    out
}
