//! Capability/requirement model and best-effort wiring.
//!
//! A wire is computed on demand: the requirement is matched against the
//! capabilities of candidate revisions in ascending module-id order and the
//! first match wins. There is no backtracking and nothing is cached, so the
//! same registry state always yields the same wire.

pub mod header;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::filter::{Filter, FilterError};
use crate::properties::Properties;
use crate::version::Version;

pub use header::{parse_clauses, Clause, HeaderError};

pub const PROVIDE_CAPABILITY: &str = "Provide-Capability";
pub const REQUIRE_CAPABILITY: &str = "Require-Capability";

pub const FILTER_DIRECTIVE: &str = "filter";
pub const RESOLUTION_DIRECTIVE: &str = "resolution";
pub const RESOLUTION_OPTIONAL: &str = "optional";

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("no provider for requirement '{namespace}' {filter} of module {requirer}")]
    NoProvider {
        requirer: u64,
        namespace: String,
        filter: String,
    },
    #[error("module {0} not found")]
    UnknownModule(u64),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("invalid requirement filter in '{namespace}'")]
    Filter {
        namespace: String,
        #[source]
        source: FilterError,
    },
}

/// Something a module provides.
#[derive(Clone, Debug, PartialEq)]
pub struct Capability {
    pub namespace: String,
    pub attributes: Properties,
    pub directives: BTreeMap<String, String>,
}

impl Capability {
    pub fn new(namespace: impl Into<String>, attributes: Properties) -> Self {
        Self {
            namespace: namespace.into(),
            attributes,
            directives: BTreeMap::new(),
        }
    }
}

/// Something a module needs, expressed as a filter over capability attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct Requirement {
    pub namespace: String,
    pub filter: Option<Filter>,
    pub directives: BTreeMap<String, String>,
}

impl Requirement {
    pub fn new(namespace: impl Into<String>, filter: Option<&str>) -> Result<Self, WiringError> {
        let namespace = namespace.into();
        let filter = filter
            .map(Filter::parse)
            .transpose()
            .map_err(|source| WiringError::Filter {
                namespace: namespace.clone(),
                source,
            })?;
        Ok(Self {
            namespace,
            filter,
            directives: BTreeMap::new(),
        })
    }

    pub fn is_optional(&self) -> bool {
        self.directives
            .get(RESOLUTION_DIRECTIVE)
            .is_some_and(|r| r == RESOLUTION_OPTIONAL)
    }

    pub fn matches(&self, capability: &Capability) -> bool {
        capability.namespace == self.namespace
            && self
                .filter
                .as_ref()
                .map_or(true, |f| f.matches(&capability.attributes))
    }

    fn describe_filter(&self) -> String {
        self.filter
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "(no filter)".to_string())
    }
}

pub fn parse_capabilities(value: &str) -> Result<Vec<Capability>, WiringError> {
    Ok(parse_clauses(PROVIDE_CAPABILITY, value)?
        .into_iter()
        .map(|c| Capability {
            namespace: c.namespace,
            attributes: c.attributes,
            directives: c.directives,
        })
        .collect())
}

pub fn parse_requirements(value: &str) -> Result<Vec<Requirement>, WiringError> {
    parse_clauses(REQUIRE_CAPABILITY, value)?
        .into_iter()
        .map(|c| {
            let mut req = Requirement::new(
                c.namespace,
                c.directives.get(FILTER_DIRECTIVE).map(String::as_str),
            )?;
            req.directives = c.directives;
            Ok(req)
        })
        .collect()
}

/// The declarations of one module, as seen by the resolver.
#[derive(Clone, Debug)]
pub struct Revision {
    pub module_id: u64,
    pub symbolic_name: String,
    pub version: Version,
    pub capabilities: Vec<Capability>,
    pub requirements: Vec<Requirement>,
}

impl Revision {
    pub fn capabilities_in<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a Capability> {
        self.capabilities
            .iter()
            .filter(move |c| c.namespace == namespace)
    }
}

/// A resolved requirement → capability pairing.
#[derive(Clone, Debug)]
pub struct Wire {
    pub requirer: Arc<Revision>,
    pub requirement: Requirement,
    pub provider: Arc<Revision>,
    pub capability: Capability,
}

/// All wires for the requirements of one revision.
#[derive(Clone, Debug)]
pub struct Wiring {
    pub revision: Arc<Revision>,
    pub required: Vec<Wire>,
}

impl Wiring {
    pub fn providers(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.required.iter().map(|w| w.provider.module_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Find the lowest-id candidate (other than the requirer) whose capability
/// satisfies `requirement`.
pub fn resolve_wire<'a, I>(
    requirer: &Arc<Revision>,
    requirement: &Requirement,
    candidates: I,
) -> Result<Wire, WiringError>
where
    I: IntoIterator<Item = &'a Arc<Revision>>,
{
    let mut ordered: Vec<&Arc<Revision>> = candidates
        .into_iter()
        .filter(|r| r.module_id != requirer.module_id)
        .collect();
    ordered.sort_by_key(|r| r.module_id);

    for provider in ordered {
        if let Some(cap) = provider
            .capabilities_in(&requirement.namespace)
            .find(|c| requirement.matches(c))
        {
            tracing::trace!(
                requirer = requirer.module_id,
                provider = provider.module_id,
                namespace = %requirement.namespace,
                "Wire resolved"
            );
            return Ok(Wire {
                requirer: Arc::clone(requirer),
                requirement: requirement.clone(),
                provider: Arc::clone(provider),
                capability: cap.clone(),
            });
        }
    }

    Err(WiringError::NoProvider {
        requirer: requirer.module_id,
        namespace: requirement.namespace.clone(),
        filter: requirement.describe_filter(),
    })
}

/// Resolve every requirement of `revision`; optional ones may stay unwired.
pub fn resolve_wiring<'a, I>(revision: &Arc<Revision>, candidates: I) -> Result<Wiring, WiringError>
where
    I: IntoIterator<Item = &'a Arc<Revision>> + Clone,
{
    let mut required = Vec::with_capacity(revision.requirements.len());
    for req in &revision.requirements {
        match resolve_wire(revision, req, candidates.clone()) {
            Ok(wire) => required.push(wire),
            Err(WiringError::NoProvider { .. }) if req.is_optional() => {
                tracing::debug!(
                    module = revision.module_id,
                    namespace = %req.namespace,
                    "Optional requirement left unwired"
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Wiring {
        revision: Arc::clone(revision),
        required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revision(id: u64, provide: &str, require: &str) -> Arc<Revision> {
        Arc::new(Revision {
            module_id: id,
            symbolic_name: format!("m{id}"),
            version: Version::default(),
            capabilities: parse_capabilities(provide).unwrap(),
            requirements: parse_requirements(require).unwrap(),
        })
    }

    #[test]
    fn lowest_id_provider_wins_repeatedly() {
        let consumer = revision(1, "", "db;filter:=\"(v>=1)\"");
        let high = revision(7, "db;v:Long=2", "");
        let low = revision(3, "db;v:Long=1", "");
        let candidates = vec![high.clone(), consumer.clone(), low.clone()];

        for _ in 0..5 {
            let wire =
                resolve_wire(&consumer, &consumer.requirements[0], candidates.iter()).unwrap();
            assert_eq!(wire.provider.module_id, 3);
            assert_eq!(
                wire.capability.attributes.get("v"),
                Some(&crate::properties::PropertyValue::Long(1))
            );
        }
    }

    #[test]
    fn namespace_must_match_and_self_is_excluded() {
        let consumer = revision(1, "db;v:Long=5", "db;filter:=\"(v>=1)\"");
        let other_ns = revision(2, "cache;v:Long=5", "");
        let candidates = [consumer.clone(), other_ns];
        let err =
            resolve_wire(&consumer, &consumer.requirements[0], candidates.iter()).unwrap_err();
        assert!(matches!(err, WiringError::NoProvider { requirer: 1, .. }));
    }

    #[test]
    fn optional_requirements_may_stay_unwired() {
        let consumer = revision(
            1,
            "",
            "db;filter:=\"(v>=1)\", log;resolution:=optional",
        );
        let db = revision(2, "db;v:Long=1", "");
        let candidates = [db];
        let wiring = resolve_wiring(&consumer, candidates.iter()).unwrap();
        assert_eq!(wiring.required.len(), 1);
        assert_eq!(wiring.providers(), vec![2]);
    }

    #[test]
    fn bad_requirement_filter_is_reported() {
        let err = parse_requirements("db;filter:=\"(v>=1\"").unwrap_err();
        assert!(matches!(err, WiringError::Filter { .. }));
    }
}
