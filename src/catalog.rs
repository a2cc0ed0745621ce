//! Tool catalog interface.
//!
//! Read-only lookup of provider, action, and trigger specs. The control
//! plane never mutates the catalog; refresh is an external concern.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A third-party provider ("toolkit").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub slug: String,
    pub name: String,
}

/// Declared parameter kind, used for template/type checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub deprecated: bool,
}

impl ActionSpec {
    pub fn required_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|p| p.required)
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub slug: String,
    #[serde(default)]
    pub required_scopes: Vec<String>,
}

/// Read-only catalog lookup consumed by the validator and compiler.
pub trait ToolCatalog: Send + Sync {
    fn get_provider(&self, slug: &str) -> Option<Provider>;
    fn get_action(&self, provider_slug: &str, action_name: &str) -> Option<ActionSpec>;
    fn get_trigger(&self, provider_slug: &str, trigger_slug: &str) -> Option<TriggerSpec>;
}

/// Registry of connections available to a tenant, used for scope checks.
#[derive(Debug, Clone, Default)]
pub struct Connections {
    by_id: HashMap<String, ConnectionInfo>,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub toolkit_slug: String,
    pub scopes: Vec<String>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: ConnectionInfo) {
        self.by_id.insert(info.connection_id.clone(), info);
    }

    pub fn get(&self, connection_id: &str) -> Option<&ConnectionInfo> {
        self.by_id.get(connection_id)
    }
}

/// In-memory catalog snapshot; the standard implementation for tests and
/// for embedding a pre-fetched catalog dump.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    providers: HashMap<String, Provider>,
    actions: HashMap<(String, String), ActionSpec>,
    triggers: HashMap<(String, String), TriggerSpec>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&mut self, slug: &str, name: &str) -> &mut Self {
        self.providers.insert(
            slug.to_string(),
            Provider {
                slug: slug.to_string(),
                name: name.to_string(),
            },
        );
        self
    }

    pub fn add_action(&mut self, provider: &str, action: &str, spec: ActionSpec) -> &mut Self {
        self.actions
            .insert((provider.to_string(), action.to_string()), spec);
        self
    }

    pub fn add_trigger(&mut self, provider: &str, trigger: &str, spec: TriggerSpec) -> &mut Self {
        self.triggers
            .insert((provider.to_string(), trigger.to_string()), spec);
        self
    }
}

impl ToolCatalog for InMemoryCatalog {
    fn get_provider(&self, slug: &str) -> Option<Provider> {
        self.providers.get(slug).cloned()
    }

    fn get_action(&self, provider_slug: &str, action_name: &str) -> Option<ActionSpec> {
        self.actions
            .get(&(provider_slug.to_string(), action_name.to_string()))
            .cloned()
    }

    fn get_trigger(&self, provider_slug: &str, trigger_slug: &str) -> Option<TriggerSpec> {
        self.triggers
            .get(&(provider_slug.to_string(), trigger_slug.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_round_trip() {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_provider("gmail", "Gmail").add_action(
            "gmail",
            "GMAIL_SEND_EMAIL",
            ActionSpec {
                params: vec![
                    ParamSpec {
                        name: "to".into(),
                        kind: ParamKind::String,
                        required: true,
                    },
                    ParamSpec {
                        name: "cc".into(),
                        kind: ParamKind::Array,
                        required: false,
                    },
                ],
                required_scopes: vec!["gmail.send".into()],
                deprecated: false,
            },
        );

        assert!(catalog.get_provider("gmail").is_some());
        assert!(catalog.get_provider("slack").is_none());

        let spec = catalog.get_action("gmail", "GMAIL_SEND_EMAIL").unwrap();
        assert_eq!(spec.required_params().count(), 1);
        assert_eq!(spec.param("cc").unwrap().kind, ParamKind::Array);
        assert!(catalog.get_action("gmail", "NOPE").is_none());
    }
}
