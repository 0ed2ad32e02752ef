//! Migration rule registry
//!
//! Rules are collected with [`MigrationRegistryBuilder`] at startup and
//! validated once in [`MigrationRegistryBuilder::build`]. The resulting
//! [`MigrationRegistry`] is immutable and shared process-wide.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Pure payload upgrade from one schema version to the next
pub type MigrationFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// One step `from_version -> to_version` for a type name
#[derive(Clone)]
pub struct MigrationRule {
    pub type_name: String,
    pub from_version: u32,
    pub to_version: u32,
    migrate: MigrationFn,
}

impl MigrationRule {
    /// Apply this rule to a payload
    pub fn apply(&self, payload: Value) -> Result<Value> {
        (self.migrate)(payload)
    }
}

impl fmt::Debug for MigrationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRule")
            .field("type_name", &self.type_name)
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .finish()
    }
}

/// Collects rules and declared versions before validation
#[derive(Default)]
pub struct MigrationRegistryBuilder {
    rules: Vec<MigrationRule>,
    declared: HashMap<String, u32>,
}

impl MigrationRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule over raw JSON payloads
    pub fn rule<F>(self, type_name: impl Into<String>, from_version: u32, to_version: u32, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.fallible_rule(type_name, from_version, to_version, move |payload| Ok(f(payload)))
    }

    /// Register a rule that may reject a payload
    pub fn fallible_rule<F>(
        mut self,
        type_name: impl Into<String>,
        from_version: u32,
        to_version: u32,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.rules.push(MigrationRule {
            type_name: type_name.into(),
            from_version,
            to_version,
            migrate: Arc::new(f),
        });
        self
    }

    /// Register a rule between two typed payload shapes
    pub fn typed_rule<Old, New, F>(
        self,
        type_name: impl Into<String>,
        from_version: u32,
        to_version: u32,
        f: F,
    ) -> Self
    where
        Old: DeserializeOwned,
        New: Serialize,
        F: Fn(Old) -> New + Send + Sync + 'static,
    {
        self.fallible_rule(type_name, from_version, to_version, move |payload| {
            let old: Old = serde_json::from_value(payload)?;
            Ok(serde_json::to_value(f(old))?)
        })
    }

    /// Declare the current schema version of a type explicitly
    ///
    /// Without a declaration the latest version is where the rule chain
    /// ends, or `1` for types with no rules.
    pub fn current_version(mut self, type_name: impl Into<String>, version: u32) -> Self {
        self.declared.insert(type_name.into(), version);
        self
    }

    /// Validate every chain and freeze the registry
    ///
    /// Rejects rules that do not move forward, duplicate source versions,
    /// rules unreachable from the lowest version (gaps), and declared
    /// versions the chain does not end at.
    pub fn build(self) -> Result<MigrationRegistry> {
        let mut by_type: HashMap<String, BTreeMap<u32, MigrationRule>> = HashMap::new();

        for rule in self.rules {
            if rule.from_version == 0 || rule.from_version >= rule.to_version {
                return Err(Error::InvalidRegistry(format!(
                    "migration for {} must move forward from a positive version, got {} -> {}",
                    rule.type_name, rule.from_version, rule.to_version
                )));
            }
            let chain = by_type.entry(rule.type_name.clone()).or_default();
            if let Some(existing) = chain.get(&rule.from_version) {
                return Err(Error::InvalidRegistry(format!(
                    "duplicate migration for {} from version {} (to {} and {})",
                    rule.type_name, rule.from_version, existing.to_version, rule.to_version
                )));
            }
            chain.insert(rule.from_version, rule);
        }

        let mut chains = HashMap::new();
        for (type_name, rules) in by_type {
            let latest = walk_chain(&type_name, &rules)?;
            if let Some(declared) = self.declared.get(&type_name) {
                if *declared != latest {
                    return Err(Error::InvalidRegistry(format!(
                        "{} declares version {} but its migrations end at {}",
                        type_name, declared, latest
                    )));
                }
            }
            chains.insert(type_name, TypeChain { rules, latest });
        }

        for (type_name, declared) in self.declared {
            if declared == 0 {
                return Err(Error::InvalidRegistry(format!(
                    "{} declares version 0; versions start at 1",
                    type_name
                )));
            }
            if !chains.contains_key(&type_name) && declared != 1 {
                return Err(Error::InvalidRegistry(format!(
                    "{} declares version {} without migrations from version 1",
                    type_name, declared
                )));
            }
        }

        Ok(MigrationRegistry { chains })
    }
}

/// Follow a chain from its lowest version; every rule must be on the path
fn walk_chain(type_name: &str, rules: &BTreeMap<u32, MigrationRule>) -> Result<u32> {
    let Some(mut version) = rules.keys().next().copied() else {
        return Ok(1);
    };

    let mut visited = 0;
    while let Some(rule) = rules.get(&version) {
        version = rule.to_version;
        visited += 1;
    }

    if visited != rules.len() {
        let unreachable: Vec<String> = rules
            .values()
            .filter(|r| r.from_version >= version)
            .map(|r| format!("{}->{}", r.from_version, r.to_version))
            .collect();
        return Err(Error::InvalidRegistry(format!(
            "migration chain for {} stops at version {}; unreachable rules: {}",
            type_name,
            version,
            unreachable.join(", ")
        )));
    }

    Ok(version)
}

struct TypeChain {
    rules: BTreeMap<u32, MigrationRule>,
    latest: u32,
}

/// Validated, read-only set of migration chains keyed by type name
#[derive(Default)]
pub struct MigrationRegistry {
    chains: HashMap<String, TypeChain>,
}

impl MigrationRegistry {
    pub fn builder() -> MigrationRegistryBuilder {
        MigrationRegistryBuilder::new()
    }

    /// Latest known schema version of a type; `1` when it has no migrations
    pub fn latest_version(&self, type_name: &str) -> u32 {
        self.chains.get(type_name).map_or(1, |c| c.latest)
    }

    /// The rule that upgrades `type_name` from `from_version`, if any
    pub fn rule(&self, type_name: &str, from_version: u32) -> Option<&MigrationRule> {
        self.chains.get(type_name)?.rules.get(&from_version)
    }

    /// Upgrade a raw payload to the latest version of its type
    ///
    /// Returns the new version with the payload. Fails with
    /// [`Error::MigrationPath`] when no rule continues from the current
    /// version, or when the payload is newer than anything known.
    pub fn upgrade(&self, type_name: &str, version: u32, payload: Value) -> Result<(u32, Value)> {
        let latest = self.latest_version(type_name);
        if version > latest || version == 0 {
            return Err(Error::MigrationPath {
                type_name: type_name.to_string(),
                from: version,
                to: latest,
            });
        }

        let mut version = version;
        let mut payload = payload;
        while version < latest {
            let rule = self.rule(type_name, version).ok_or_else(|| Error::MigrationPath {
                type_name: type_name.to_string(),
                from: version,
                to: latest,
            })?;
            payload = rule.apply(payload)?;
            version = rule.to_version;
        }

        Ok((version, payload))
    }
}
