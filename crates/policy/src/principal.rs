use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Attribute naming the requesting user in audit records.
pub const USER_ID_ATTRIBUTE: &str = "user_id";

/// Authenticated requester, as supplied by the caller's identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub role_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Principal {
    pub fn new(role_name: &str) -> Self {
        Self {
            role_name: role_name.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.attribute(USER_ID_ATTRIBUTE)
    }
}
