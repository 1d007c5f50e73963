//! Table and function reference resolution.
//!
//! Turns references as written in SQL (`orders`, `Staging.Orders`,
//! `"raw"."events"`) into fully-qualified, case-normalised [`NodeId`]s.

use crate::node::SchemaDefaults;
use crate::node_id::NodeId;
use std::collections::{HashMap, HashSet};

/// Outcome of resolving a single reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The reference maps to this id
    Resolved(NodeId),
    /// No known node matches; callers treat this as a soft warning
    NotFound { reference: String },
}

impl Resolution {
    /// The resolved id, if any
    pub fn id(&self) -> Option<&NodeId> {
        match self {
            Resolution::Resolved(id) => Some(id),
            Resolution::NotFound { .. } => None,
        }
    }
}

/// Resolves references against a default schema, aliases and known functions
#[derive(Debug, Clone)]
pub struct Resolver {
    default_schema: String,
    aliases: HashMap<String, NodeId>,
    known_functions: HashSet<NodeId>,
}

impl Resolver {
    /// Create a resolver that prefixes bare references with `default_schema`
    pub fn new(default_schema: &str) -> Self {
        Self {
            default_schema: default_schema.trim().to_lowercase(),
            aliases: HashMap::new(),
            known_functions: HashSet::new(),
        }
    }

    /// Add a project-wide alias. Aliases only apply to bare references.
    pub fn with_alias(mut self, alias: &str, target: &str) -> Self {
        self.add_alias(alias, target);
        self
    }

    /// Add a project-wide alias in place
    pub fn add_alias(&mut self, alias: &str, target: &str) {
        if let (Some(a), Some(t)) = (NodeId::normalized(alias), NodeId::normalized(target)) {
            self.aliases.insert(a.into_inner(), t);
        }
    }

    /// Record a function id so function references can be checked against it
    pub fn register_function(&mut self, id: NodeId) {
        self.known_functions.insert(id);
    }

    /// The schema applied when neither the reference nor the record has one
    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }

    /// Qualify a reference.
    ///
    /// A reference that already contains a schema separator is returned
    /// as-is (case-normalised); otherwise it is prefixed with
    /// `default_schema`, falling back to the resolver's own default.
    pub fn resolve(&self, reference: &str, default_schema: Option<&str>) -> Resolution {
        let Some(id) = NodeId::normalized(reference) else {
            return Resolution::NotFound {
                reference: reference.to_string(),
            };
        };
        if id.is_qualified() {
            return Resolution::Resolved(id);
        }
        if let Some(target) = self.aliases.get(id.as_str()) {
            return Resolution::Resolved(target.clone());
        }
        let schema = default_schema
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.default_schema.clone());
        Resolution::Resolved(NodeId::new(format!("{}.{}", schema, id)))
    }

    /// Qualify a table reference using a record's local aliases and schema
    pub fn resolve_table(&self, reference: &str, defaults: &SchemaDefaults) -> Resolution {
        if let Some(target) = self.local_alias(reference, defaults) {
            return Resolution::Resolved(target);
        }
        self.resolve(reference, defaults.schema.as_deref())
    }

    /// Resolve a function reference against the set of known function ids.
    ///
    /// A bare reference that does not match after qualification still
    /// resolves when exactly one known function carries that short name.
    pub fn resolve_function(&self, reference: &str, defaults: &SchemaDefaults) -> Resolution {
        let not_found = || Resolution::NotFound {
            reference: reference.to_string(),
        };

        let qualified = match self.resolve_table(reference, defaults) {
            Resolution::Resolved(id) => id,
            other => return other,
        };
        if self.known_functions.contains(&qualified) {
            return Resolution::Resolved(qualified);
        }

        let bare = NodeId::normalized(reference).filter(|id| !id.is_qualified());
        let Some(bare) = bare else {
            return not_found();
        };
        let mut candidates = self
            .known_functions
            .iter()
            .filter(|f| f.short_name() == bare.as_str());
        match (candidates.next(), candidates.next()) {
            (Some(only), None) => Resolution::Resolved(only.clone()),
            _ => not_found(),
        }
    }

    fn local_alias(&self, reference: &str, defaults: &SchemaDefaults) -> Option<NodeId> {
        if defaults.aliases.is_empty() {
            return None;
        }
        let key = NodeId::normalized(reference)?;
        defaults
            .aliases
            .iter()
            .find(|(alias, _)| NodeId::normalized(alias).as_ref() == Some(&key))
            .and_then(|(_, target)| NodeId::normalized(target))
    }
}
