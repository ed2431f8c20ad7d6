//! Authorization request URL (RFC 6749 §4.1.1, RFC 7636 §4.3)

use url::Url;

use crate::error::{Error, Result};
use crate::pkce::PkcePair;

/// Parameters of one authorization redirect.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest<'a> {
    pub authorization_endpoint: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a [String],
    pub state: Option<&'a str>,
    /// `None` when PKCE is deliberately disabled for the flow.
    pub pkce: Option<&'a PkcePair>,
    pub nonce: Option<&'a str>,
}

/// Build the full authorization URL.
///
/// Parameters already present on the endpoint (e.g. a Keycloak `kc_idp_hint`)
/// are preserved; ours are appended and percent-encoded by `url`.
pub fn build_authorization_url(request: &AuthorizationRequest<'_>) -> Result<String> {
    let mut url = Url::parse(request.authorization_endpoint)
        .map_err(|e| Error::InvalidUrl(format!("{}: {e}", request.authorization_endpoint)))?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", request.client_id)
            .append_pair("redirect_uri", request.redirect_uri);
        if !request.scopes.is_empty() {
            query.append_pair("scope", &request.scopes.join(" "));
        }
        if let Some(state) = request.state {
            query.append_pair("state", state);
        }
        if let Some(pkce) = request.pkce {
            query
                .append_pair("code_challenge", pkce.challenge())
                .append_pair("code_challenge_method", pkce.method().as_str());
        }
        if let Some(nonce) = request.nonce {
            query.append_pair("nonce", nonce);
        }
    }

    Ok(url.into())
}
