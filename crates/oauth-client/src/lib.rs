//! OAuth 2.0 client-side protocol helpers
//!
//! Everything a client needs to run an Authorization Code + PKCE flow except
//! token validation (see the `token-validator` crate):
//!
//! 1. `pkce::PkcePair::generate()` creates the verifier/challenge pair
//! 2. `state::StateRegistry::issue()` creates a single-use CSRF state value
//! 3. `authorize::build_authorization_url()` assembles the redirect
//! 4. `state::StateRegistry::consume()` checks the state on callback
//! 5. `token::TokenEndpoint::exchange()` trades the code + verifier for tokens

pub mod authorize;
pub mod constants;
pub mod error;
pub mod pkce;
pub mod state;
pub mod token;

pub use authorize::{AuthorizationRequest, build_authorization_url};
pub use error::{Error, Result};
pub use pkce::{ChallengeMethod, PkcePair};
pub use state::{StateError, StateRecord, StateRegistry};
pub use token::{ExchangeRequest, HttpTokenEndpoint, TokenEndpoint, TokenSet};
