use crate::domain_model::UserId;

pub const DEFAULT_KEY_PREFIX: &str = "token";

/// Namespaced key scheme shared by the local cache and the remote store.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
}

/// A primary-record key decoded back into its namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey<'a> {
    Refresh(&'a str),
    Access(&'a str),
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = if prefix.is_empty() {
            DEFAULT_KEY_PREFIX.to_string()
        } else {
            prefix
        };
        KeyLayout { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn refresh(&self, token_id: &str) -> String {
        format!("{}:refresh:{}", self.prefix, token_id)
    }

    pub fn access(&self, token_id: &str) -> String {
        format!("{}:access:{}", self.prefix, token_id)
    }

    pub fn family(&self, family_id: &str) -> String {
        format!("{}:family:{}", self.prefix, family_id)
    }

    pub fn user_families(&self, user_id: UserId) -> String {
        format!("{}:user_families:{}", self.prefix, user_id)
    }

    pub fn parse<'a>(&self, key: &'a str) -> Option<RecordKey<'a>> {
        let rest = key.strip_prefix(self.prefix.as_str())?.strip_prefix(':')?;
        if let Some(id) = rest.strip_prefix("refresh:") {
            return Some(RecordKey::Refresh(id));
        }
        if let Some(id) = rest.strip_prefix("access:") {
            return Some(RecordKey::Access(id));
        }
        None
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        KeyLayout::new(DEFAULT_KEY_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_scheme() {
        let keys = KeyLayout::default();
        assert_eq!(keys.refresh("abc"), "token:refresh:abc");
        assert_eq!(keys.access("abc"), "token:access:abc");
        assert_eq!(keys.family("f1"), "token:family:f1");
        assert_eq!(keys.user_families(UserId(7)), "token:user_families:7");
    }

    #[test]
    fn parse_only_recognizes_primary_records_under_own_prefix() {
        let keys = KeyLayout::new("auth");
        assert_eq!(keys.parse("auth:refresh:x:y"), Some(RecordKey::Refresh("x:y")));
        assert_eq!(keys.parse("auth:access:z"), Some(RecordKey::Access("z")));
        assert_eq!(keys.parse("auth:family:f"), None);
        assert_eq!(keys.parse("token:refresh:x"), None);
        assert_eq!(keys.parse("authrefresh:x"), None);
    }

    #[test]
    fn empty_prefix_falls_back_to_default() {
        assert_eq!(KeyLayout::new("").prefix(), DEFAULT_KEY_PREFIX);
    }
}
