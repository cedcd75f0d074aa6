use keyring::Entry;

const SESSION_KEYRING_SERVICE: &str = "streamchat_session";

// The identity provider boundary. The chat core only consumes a signed-in
// signal and a label for the user menu; it never authenticates anyone
// itself.
pub trait IdentityProvider: Send + Sync {
    fn is_signed_in(&self) -> bool;
    fn user_label(&self) -> Option<String>;
}

// Identity backed by a locally provisioned session token: signed in means
// a token is present in the environment or the OS keyring.
pub struct TokenIdentity {
    user: String,
    token: Option<String>,
}

impl TokenIdentity {
    pub fn from_env() -> Self {
        let user = std::env::var("STREAMCHAT_USER").unwrap_or_else(|_| "local user".to_string());

        let token = match std::env::var("STREAMCHAT_SESSION_TOKEN") {
            Ok(token) if !token.trim().is_empty() => Some(token),
            _ => {
                log::debug!("No session token in environment, checking keyring");
                Entry::new(SESSION_KEYRING_SERVICE, &user)
                    .and_then(|entry| entry.get_password())
                    .ok()
            }
        };

        if token.is_none() {
            log::warn!("No session token found for '{}'", user);
        }

        Self { user, token }
    }
}

impl IdentityProvider for TokenIdentity {
    fn is_signed_in(&self) -> bool {
        self.token.is_some()
    }

    fn user_label(&self) -> Option<String> {
        self.token.as_ref().map(|_| self.user.clone())
    }
}
