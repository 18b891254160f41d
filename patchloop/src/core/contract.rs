//! Public-contract snapshots and the non-breaking comparison.
//!
//! A snapshot is a sorted list of public symbols and HTTP endpoints. The lock
//! is the snapshot the run promised not to break: later snapshots may add to
//! it but must keep every locked entry (and every locked signature).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContractSymbol {
    /// `function`, `class`, `method`, `type`, ...
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub path: String,
}

impl ContractSymbol {
    fn key(&self) -> (&str, &str, &str) {
        (&self.path, &self.kind, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContractEndpoint {
    pub method: String,
    pub route: String,
    pub path: String,
}

impl ContractEndpoint {
    /// Endpoints are identified by method and route; the declaring file may move.
    fn key(&self) -> (String, &str) {
        (self.method.to_ascii_uppercase(), &self.route)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSnapshot {
    pub symbols: Vec<ContractSymbol>,
    pub endpoints: Vec<ContractEndpoint>,
    pub hash: String,
}

impl ContractSnapshot {
    /// Build a canonical snapshot: entries sorted and deduplicated, hash computed.
    pub fn new(mut symbols: Vec<ContractSymbol>, mut endpoints: Vec<ContractEndpoint>) -> Self {
        symbols.sort();
        symbols.dedup();
        endpoints.sort();
        endpoints.dedup();
        let hash = canonical_hash(&symbols, &endpoints);
        Self {
            symbols,
            endpoints,
            hash,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty() && self.endpoints.is_empty()
    }

    /// Breaking differences from `self` (the lock) to `current`.
    ///
    /// Removed symbols, changed signatures, and removed endpoints are
    /// violations. Additions never are.
    pub fn violations(&self, current: &ContractSnapshot) -> Vec<String> {
        let mut violations = Vec::new();

        // Overloads and property accessors share a key, so each key maps to
        // every signature currently declared under it.
        let mut now: BTreeMap<_, Vec<Option<&str>>> = BTreeMap::new();
        for symbol in &current.symbols {
            now.entry(symbol.key()).or_default().push(symbol.signature.as_deref());
        }
        for locked in &self.symbols {
            let Some(found) = now.get(&locked.key()) else {
                violations.push(format!(
                    "removed {} '{}' from {}",
                    locked.kind, locked.name, locked.path
                ));
                continue;
            };
            let Some(expected) = locked.signature.as_deref() else {
                continue;
            };
            if !found.contains(&Some(expected)) {
                let actual: Vec<&str> = found.iter().map(|s| s.unwrap_or("")).collect();
                violations.push(format!(
                    "changed signature of {} '{}' in {}: '{}' -> '{}'",
                    locked.kind,
                    locked.name,
                    locked.path,
                    expected,
                    actual.join("' | '")
                ));
            }
        }

        let routes: BTreeMap<_, _> = current.endpoints.iter().map(|e| (e.key(), e)).collect();
        for locked in &self.endpoints {
            if !routes.contains_key(&locked.key()) {
                violations.push(format!(
                    "removed endpoint {} {} (was in {})",
                    locked.method.to_ascii_uppercase(),
                    locked.route,
                    locked.path
                ));
            }
        }
        violations
    }

    /// Extend the lock with everything new in `current`.
    ///
    /// Fails with the violation list when `current` is not a superset, so a
    /// lock can only ever grow.
    pub fn merge_additive(&self, current: &ContractSnapshot) -> Result<ContractSnapshot, Vec<String>> {
        let violations = self.violations(current);
        if !violations.is_empty() {
            return Err(violations);
        }
        let mut symbols = self.symbols.clone();
        symbols.extend(
            current
                .symbols
                .iter()
                .filter(|s| !self.symbols.contains(s))
                .cloned(),
        );
        let mut endpoints = self.endpoints.clone();
        let known_routes: Vec<_> = self.endpoints.iter().map(ContractEndpoint::key).collect();
        endpoints.extend(
            current
                .endpoints
                .iter()
                .filter(|e| !known_routes.contains(&e.key()))
                .cloned(),
        );
        Ok(ContractSnapshot::new(symbols, endpoints))
    }
}

fn canonical_hash(symbols: &[ContractSymbol], endpoints: &[ContractEndpoint]) -> String {
    let mut hasher = Sha256::new();
    for s in symbols {
        hasher.update(format!(
            "symbol\t{}\t{}\t{}\t{}\n",
            s.path,
            s.kind,
            s.name,
            s.signature.as_deref().unwrap_or("")
        ));
    }
    for e in endpoints {
        hasher.update(format!(
            "endpoint\t{}\t{}\t{}\n",
            e.method.to_ascii_uppercase(),
            e.route,
            e.path
        ));
    }
    hex::encode(hasher.finalize())
}
