/// Secret placeholder resolution
///
/// Programs refer to secrets as `$secret.<name>`; the resolver turns such a
/// placeholder into its value at run time.

use std::collections::HashMap;

const PLACEHOLDER_PREFIX: &str = "$secret.";

pub trait SecretResolver: Send + Sync {
    fn resolve(&self, placeholder: &str) -> Option<String>;
}

/// Name part of a `$secret.<name>` placeholder
pub fn secret_name(placeholder: &str) -> Option<&str> {
    placeholder
        .strip_prefix(PLACEHOLDER_PREFIX)
        .filter(|name| !name.is_empty())
}

/// Reads `FLOWGATE_SECRET_<NAME>` from the environment
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretResolver;

impl EnvSecretResolver {
    pub fn env_key(name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("FLOWGATE_SECRET_{}", normalized)
    }
}

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, placeholder: &str) -> Option<String> {
        let name = secret_name(placeholder)?;
        std::env::var(Self::env_key(name)).ok()
    }
}

/// Fixed name → value table
#[derive(Debug, Default, Clone)]
pub struct StaticSecretResolver {
    secrets: HashMap<String, String>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

impl SecretResolver for StaticSecretResolver {
    fn resolve(&self, placeholder: &str) -> Option<String> {
        secret_name(placeholder).and_then(|name| self.secrets.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_parsing() {
        assert_eq!(secret_name("$secret.api_key"), Some("api_key"));
        assert_eq!(secret_name("$secret."), None);
        assert_eq!(secret_name("api_key"), None);
    }

    #[test]
    fn env_resolver_reads_normalized_key() {
        assert_eq!(EnvSecretResolver::env_key("stripe-key"), "FLOWGATE_SECRET_STRIPE_KEY");

        std::env::set_var("FLOWGATE_SECRET_RESOLVER_TEST", "s3cr3t");
        assert_eq!(
            EnvSecretResolver.resolve("$secret.resolver_test"),
            Some("s3cr3t".to_string())
        );
        std::env::remove_var("FLOWGATE_SECRET_RESOLVER_TEST");
    }

    #[test]
    fn static_resolver_lookup() {
        let secrets = StaticSecretResolver::new().with_secret("token", "abc");
        assert_eq!(secrets.resolve("$secret.token"), Some("abc".into()));
        assert_eq!(secrets.resolve("$secret.missing"), None);
    }
}
