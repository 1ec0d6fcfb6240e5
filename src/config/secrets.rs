//! Destination tokens.
//!
//! A token is wrapped in [`SecretString`] as soon as it is read, whether it
//! came inline from a config file or from an environment variable, and is
//! only exposed when a request header is built.

pub use secrecy::{ExposeSecret, SecretString};

/// The inline token if present, otherwise the value of `env_var`.
pub fn resolve_token(inline: Option<String>, env_var: Option<&str>) -> Option<SecretString> {
    inline
        .filter(|t| !t.is_empty())
        .or_else(|| {
            env_var
                .and_then(|name| std::env::var(name).ok())
                .filter(|t| !t.is_empty())
        })
        .map(SecretString::from)
}

/// An independent copy of a secret.
pub fn duplicate(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_token_wins() {
        let token = resolve_token(Some("inline".into()), Some("PULSE_TEST_UNSET_TOKEN_VAR"));
        assert_eq!(token.unwrap().expose_secret(), "inline");
    }

    #[test]
    fn empty_and_missing_resolve_to_none() {
        assert!(resolve_token(Some(String::new()), None).is_none());
        assert!(resolve_token(None, Some("PULSE_TEST_UNSET_TOKEN_VAR")).is_none());
    }

    #[test]
    fn duplicate_keeps_the_value() {
        let original = SecretString::from("k".to_string());
        assert_eq!(duplicate(&original).expose_secret(), "k");
    }
}
