use {
    async_trait::async_trait,
    guildrelay_config::{AuthConfig, TokenGrant},
    guildrelay_relay::{AuthResolver, Identity},
    secrecy::ExposeSecret,
};

/// Role that lets a caller post platform dispatches to `/mirror`.
pub const MIRROR_ROLE: &str = "mirror";

/// Resolves bearer tokens listed in the config file.
pub struct StaticTokenAuth {
    grants: Vec<TokenGrant>,
}

impl StaticTokenAuth {
    pub fn new(grants: Vec<TokenGrant>) -> Self {
        Self { grants }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.tokens.clone())
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[async_trait]
impl AuthResolver for StaticTokenAuth {
    async fn resolve(&self, token: &str) -> Option<Identity> {
        if token.is_empty() {
            return None;
        }
        self.grants
            .iter()
            .find(|g| constant_time_eq(g.token.expose_secret(), token))
            .map(|g| Identity {
                user_id: g.user_id.clone(),
                display_name: g.display_name.clone().unwrap_or_else(|| g.user_id.clone()),
                roles: g.roles.clone(),
            })
    }
}

/// Constant-time string comparison.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Pull a bearer token out of an `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}
