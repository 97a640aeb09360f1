//! Role registry: authority levels and delegation rights
//!
//! A role is a named participant with a fixed authority level and the set of
//! `(target role, phase)` pairs it may hand work to. The registry is loaded
//! once from configuration and never mutated afterwards, so it is shared
//! behind an `Arc` without locking.

use crate::{Phase, RoleId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Ordered authority levels. Comparison follows declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityLevel {
    Propose,
    Implement,
    Validate,
    Oversee,
}

impl AuthorityLevel {
    /// May author validation records
    pub fn can_validate(self) -> bool {
        self >= AuthorityLevel::Validate
    }

    /// May cast crisis ballots
    pub fn can_vote(self) -> bool {
        self >= AuthorityLevel::Implement
    }
}

impl fmt::Display for AuthorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthorityLevel::Propose => "propose",
            AuthorityLevel::Implement => "implement",
            AuthorityLevel::Validate => "validate",
            AuthorityLevel::Oversee => "oversee",
        };
        write!(f, "{}", name)
    }
}

/// Permission to hand work of one phase to one role
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DelegationRight {
    pub role: RoleId,
    pub phase: Phase,
}

impl DelegationRight {
    pub fn new(role: RoleId, phase: Phase) -> Self {
        Self { role, phase }
    }
}

/// A registry entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub authority: AuthorityLevel,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub delegates: BTreeSet<DelegationRight>,
}

impl Role {
    pub fn new(id: impl Into<String>, authority: AuthorityLevel) -> Self {
        Self {
            id: RoleId::new(id),
            authority,
            description: String::new(),
            delegates: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn delegates_to(mut self, role: impl Into<String>, phase: Phase) -> Self {
        self.delegates
            .insert(DelegationRight::new(RoleId::new(role), phase));
        self
    }
}

/// Role definitions as they appear in configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl RegistryConfig {
    /// Planner, implementer, validator and overseer: the smallest council
    /// that exercises every phase.
    pub fn standard() -> Self {
        Self {
            roles: vec![
                Role::new("planner", AuthorityLevel::Propose)
                    .with_description("Decomposes requests into phased work")
                    .delegates_to("implementer", Phase::Implement)
                    .delegates_to("validator", Phase::Validate),
                Role::new("implementer", AuthorityLevel::Implement)
                    .with_description("Produces results")
                    .delegates_to("validator", Phase::Validate),
                Role::new("validator", AuthorityLevel::Validate)
                    .with_description("Judges results before acceptance"),
                Role::new("overseer", AuthorityLevel::Oversee)
                    .with_description("Reserve authority for crisis cases"),
            ],
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }
}

/// Errors raised while loading the registry
#[derive(Clone, Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Role registry is empty")]
    Empty,

    #[error("Duplicate role: {0}")]
    DuplicateRole(RoleId),

    #[error("Role {from} delegates to unknown role {to}")]
    UnknownDelegate { from: RoleId, to: RoleId },

    #[error("Role {role} ({authority}) cannot own {phase} tasks")]
    InsufficientAuthority {
        role: RoleId,
        authority: AuthorityLevel,
        phase: Phase,
    },

    #[error("No role holds oversee authority")]
    MissingOverseer,

    #[error("More than one role holds oversee authority: {0:?}")]
    MultipleOverseers(Vec<RoleId>),

    #[error("At least one validate-level role besides the overseer is required")]
    MissingValidator,

    #[error("Unknown role: {0}")]
    UnknownRole(RoleId),
}

/// The validated, read-only role table
#[derive(Clone, Debug)]
pub struct RoleRegistry {
    roles: BTreeMap<RoleId, Role>,
    overseer: RoleId,
}

impl RoleRegistry {
    /// Validate and load a registry
    pub fn load(config: RegistryConfig) -> Result<Self, RegistryError> {
        if config.roles.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut roles = BTreeMap::new();
        for role in config.roles {
            if roles.contains_key(&role.id) {
                return Err(RegistryError::DuplicateRole(role.id));
            }
            roles.insert(role.id.clone(), role);
        }

        for role in roles.values() {
            for right in &role.delegates {
                let target =
                    roles
                        .get(&right.role)
                        .ok_or_else(|| RegistryError::UnknownDelegate {
                            from: role.id.clone(),
                            to: right.role.clone(),
                        })?;
                if target.authority < right.phase.minimum_authority() {
                    return Err(RegistryError::InsufficientAuthority {
                        role: target.id.clone(),
                        authority: target.authority,
                        phase: right.phase,
                    });
                }
            }
        }

        let overseers: Vec<RoleId> = roles
            .values()
            .filter(|r| r.authority == AuthorityLevel::Oversee)
            .map(|r| r.id.clone())
            .collect();
        if overseers.len() > 1 {
            return Err(RegistryError::MultipleOverseers(overseers));
        }
        let overseer = overseers
            .into_iter()
            .next()
            .ok_or(RegistryError::MissingOverseer)?;

        if !roles
            .values()
            .any(|r| r.authority == AuthorityLevel::Validate)
        {
            return Err(RegistryError::MissingValidator);
        }

        Ok(Self { roles, overseer })
    }

    pub fn get(&self, id: &RoleId) -> Option<&Role> {
        self.roles.get(id)
    }

    pub fn require(&self, id: &RoleId) -> Result<&Role, RegistryError> {
        self.roles
            .get(id)
            .ok_or_else(|| RegistryError::UnknownRole(id.clone()))
    }

    pub fn authority_of(&self, id: &RoleId) -> Option<AuthorityLevel> {
        self.roles.get(id).map(|r| r.authority)
    }

    pub fn can_delegate(&self, from: &RoleId, to: &RoleId, phase: Phase) -> bool {
        self.roles.contains_key(to)
            && self.roles.get(from).is_some_and(|role| {
                role.delegates
                    .contains(&DelegationRight::new(to.clone(), phase))
            })
    }

    /// The sole role with oversee authority
    pub fn overseer(&self) -> &RoleId {
        &self.overseer
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Roles eligible to vote on a crisis about `disputed`
    pub fn voters(&self, disputed: Option<&RoleId>, excluded: &BTreeSet<RoleId>) -> BTreeSet<RoleId> {
        self.roles
            .values()
            .filter(|r| r.authority.can_vote())
            .filter(|r| Some(&r.id) != disputed && !excluded.contains(&r.id))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Lowest `(authority, id)` validator-level role other than `owner`
    pub fn countersigner_for(&self, owner: &RoleId, excluded: &BTreeSet<RoleId>) -> Option<RoleId> {
        self.roles
            .values()
            .filter(|r| r.authority.can_validate() && r.id != *owner && !excluded.contains(&r.id))
            .min_by(|a, b| (a.authority, &a.id).cmp(&(b.authority, &b.id)))
            .map(|r| r.id.clone())
    }

    /// Role that reviews an implementation by `owner` when none was delegated.
    ///
    /// Prefers the first role `owner` may hand validation to, then the first
    /// plain validate-level role, then any countersigner.
    pub fn reviewer_for(&self, owner: &RoleId, excluded: &BTreeSet<RoleId>) -> Option<RoleId> {
        let usable = |id: &RoleId| {
            id != owner
                && !excluded.contains(id)
                && self.authority_of(id).is_some_and(|a| a.can_validate())
        };

        if let Some(role) = self.roles.get(owner) {
            if let Some(right) = role
                .delegates
                .iter()
                .find(|d| d.phase == Phase::Validate && usable(&d.role))
            {
                return Some(right.role.clone());
            }
        }

        self.roles
            .values()
            .find(|r| r.authority == AuthorityLevel::Validate && usable(&r.id))
            .map(|r| r.id.clone())
            .or_else(|| self.countersigner_for(owner, excluded))
    }

    /// Another role of the same authority, used as a replacement when a
    /// role is excluded
    pub fn alternate_for(&self, role: &RoleId, excluded: &BTreeSet<RoleId>) -> Option<RoleId> {
        let authority = self.authority_of(role)?;
        self.roles
            .values()
            .find(|r| r.authority == authority && r.id != *role && !excluded.contains(&r.id))
            .map(|r| r.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(id: &str) -> RoleId {
        RoleId::new(id)
    }

    #[test]
    fn test_standard_registry_loads() {
        let registry = RoleRegistry::load(RegistryConfig::standard()).unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.overseer(), &role("overseer"));
        assert_eq!(
            registry.authority_of(&role("validator")),
            Some(AuthorityLevel::Validate)
        );
    }

    #[test]
    fn test_can_delegate_requires_exact_pair() {
        let registry = RoleRegistry::load(RegistryConfig::standard()).unwrap();
        assert!(registry.can_delegate(&role("planner"), &role("implementer"), Phase::Implement));
        assert!(!registry.can_delegate(&role("planner"), &role("implementer"), Phase::Validate));
        assert!(!registry.can_delegate(&role("implementer"), &role("planner"), Phase::Propose));
        assert!(!registry.can_delegate(&role("ghost"), &role("validator"), Phase::Validate));
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let config = RegistryConfig::standard().with_role(Role::new("planner", AuthorityLevel::Propose));
        assert!(matches!(
            RoleRegistry::load(config),
            Err(RegistryError::DuplicateRole(_))
        ));
    }

    #[test]
    fn test_unknown_delegate_rejected() {
        let config = RegistryConfig::standard()
            .with_role(Role::new("scout", AuthorityLevel::Propose).delegates_to("nobody", Phase::Implement));
        assert!(matches!(
            RoleRegistry::load(config),
            Err(RegistryError::UnknownDelegate { .. })
        ));
    }

    #[test]
    fn test_delegate_must_hold_phase_authority() {
        let config = RegistryConfig::standard()
            .with_role(Role::new("scout", AuthorityLevel::Propose).delegates_to("planner", Phase::Validate));
        assert!(matches!(
            RoleRegistry::load(config),
            Err(RegistryError::InsufficientAuthority { .. })
        ));
    }

    #[test]
    fn test_exactly_one_overseer() {
        let two = RegistryConfig::standard().with_role(Role::new("chair", AuthorityLevel::Oversee));
        assert!(matches!(
            RoleRegistry::load(two),
            Err(RegistryError::MultipleOverseers(_))
        ));

        let none = RegistryConfig {
            roles: vec![Role::new("validator", AuthorityLevel::Validate)],
        };
        assert!(matches!(
            RoleRegistry::load(none),
            Err(RegistryError::MissingOverseer)
        ));
    }

    #[test]
    fn test_validator_required_besides_overseer() {
        let config = RegistryConfig {
            roles: vec![
                Role::new("planner", AuthorityLevel::Propose),
                Role::new("overseer", AuthorityLevel::Oversee),
            ],
        };
        assert!(matches!(
            RoleRegistry::load(config),
            Err(RegistryError::MissingValidator)
        ));
    }

    #[test]
    fn test_voters_exclude_disputed_and_proposers() {
        let registry = RoleRegistry::load(RegistryConfig::standard()).unwrap();
        let voters = registry.voters(Some(&role("implementer")), &BTreeSet::new());
        assert_eq!(
            voters,
            [role("overseer"), role("validator")].into_iter().collect()
        );
    }

    #[test]
    fn test_countersigner_is_lowest_validator_other_than_owner() {
        let registry = RoleRegistry::load(RegistryConfig::standard()).unwrap();
        let none = BTreeSet::new();
        assert_eq!(registry.countersigner_for(&role("planner"), &none), Some(role("validator")));
        assert_eq!(registry.countersigner_for(&role("validator"), &none), Some(role("overseer")));
        assert_eq!(registry.countersigner_for(&role("overseer"), &none), Some(role("validator")));
    }

    #[test]
    fn test_reviewer_prefers_delegation_right() {
        let config = RegistryConfig::standard()
            .with_role(Role::new("auditor", AuthorityLevel::Validate))
            .with_role(Role::new("builder", AuthorityLevel::Implement).delegates_to("auditor", Phase::Validate));
        let registry = RoleRegistry::load(config).unwrap();
        let none = BTreeSet::new();
        assert_eq!(registry.reviewer_for(&role("builder"), &none), Some(role("auditor")));
        // the planner's own right wins over the alphabetically earlier auditor
        assert_eq!(registry.reviewer_for(&role("planner"), &none), Some(role("validator")));
        let excluded: BTreeSet<RoleId> = [role("validator")].into_iter().collect();
        assert_eq!(registry.reviewer_for(&role("implementer"), &excluded), Some(role("auditor")));
    }

    #[test]
    fn test_alternate_has_equal_authority() {
        let config = RegistryConfig::standard().with_role(Role::new("implementer-b", AuthorityLevel::Implement));
        let registry = RoleRegistry::load(config).unwrap();
        let none = BTreeSet::new();
        assert_eq!(
            registry.alternate_for(&role("implementer"), &none),
            Some(role("implementer-b"))
        );
        assert_eq!(registry.alternate_for(&role("overseer"), &none), None);
    }
}
