// Immutable policy snapshot and the authorization evaluator

use crate::errors::{PolicyError, PolicyWarning};
use crate::models::{
    AuthorizationDecision, Binding, Grant, PolicyRule, RequestAttributes, Role, RoleRef,
    RoleScope, Subject, UserInfo,
};
use crate::rbac::matching::{rule_matches, subject_matches};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Problems found while building a snapshot. Rejected items are excluded,
/// warnings are kept but inert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub warnings: Vec<PolicyWarning>,
    pub rejected: Vec<PolicyError>,
}

impl BuildReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.rejected.is_empty()
    }
}

/// Indexed, read-only view of every role and binding.
///
/// Evaluation never mutates the snapshot; share it behind an `Arc` and
/// replace it wholesale to pick up new policy.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    cluster_roles: HashMap<String, Role>,
    /// Keyed by (namespace, name)
    namespaced_roles: HashMap<(String, String), Role>,
    cluster_bindings: Vec<Binding>,
    /// Keyed by namespace
    namespaced_bindings: HashMap<String, Vec<Binding>>,
}

impl PolicySnapshot {
    /// A snapshot granting nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Index roles and bindings.
    ///
    /// Invalid entries are rejected individually; the rest of the policy
    /// still loads.
    pub fn build(roles: Vec<Role>, bindings: Vec<Binding>) -> (Self, BuildReport) {
        let mut snapshot = Self::default();
        let mut report = BuildReport::default();

        for role in roles {
            let duplicate = match &role.scope {
                RoleScope::Cluster => snapshot.cluster_roles.contains_key(&role.name),
                RoleScope::Namespaced(ns) => snapshot
                    .namespaced_roles
                    .contains_key(&(ns.clone(), role.name.clone())),
            };
            if duplicate {
                report.rejected.push(PolicyError::DuplicateRole {
                    name: role.name.clone(),
                    scope: role.scope.to_string(),
                });
                continue;
            }
            match &role.scope {
                RoleScope::Cluster => {
                    snapshot.cluster_roles.insert(role.name.clone(), role);
                }
                RoleScope::Namespaced(ns) => {
                    snapshot
                        .namespaced_roles
                        .insert((ns.clone(), role.name.clone()), role);
                }
            }
        }

        for binding in bindings {
            if binding.scope == RoleScope::Cluster {
                if let RoleRef::Role { name } = &binding.role_ref {
                    report.rejected.push(PolicyError::InvalidBindingScope {
                        binding: binding.name.clone(),
                        role: name.clone(),
                    });
                    continue;
                }
            }
            if snapshot.resolve(&binding).is_none() {
                report.warnings.push(PolicyWarning::DanglingReference {
                    binding: binding.name.clone(),
                    role: binding.role_ref.to_string(),
                });
            }
            match &binding.scope {
                RoleScope::Cluster => snapshot.cluster_bindings.push(binding),
                RoleScope::Namespaced(ns) => snapshot
                    .namespaced_bindings
                    .entry(ns.clone())
                    .or_default()
                    .push(binding),
            }
        }

        (snapshot, report)
    }

    pub fn role_count(&self) -> usize {
        self.cluster_roles.len() + self.namespaced_roles.len()
    }

    pub fn binding_count(&self) -> usize {
        self.cluster_bindings.len() + self.namespaced_bindings.values().map(Vec::len).sum::<usize>()
    }

    /// The role a binding grants, if it exists. A `Role` reference resolves
    /// in the binding's own namespace.
    fn resolve(&self, binding: &Binding) -> Option<&Role> {
        match (&binding.role_ref, &binding.scope) {
            (RoleRef::ClusterRole { name }, _) => self.cluster_roles.get(name),
            (RoleRef::Role { name }, RoleScope::Namespaced(ns)) => {
                self.namespaced_roles.get(&(ns.clone(), name.clone()))
            }
            (RoleRef::Role { .. }, RoleScope::Cluster) => None,
        }
    }

    /// Bindings that apply to the requester within `namespace`: every
    /// cluster binding plus that namespace's bindings. Cluster-scoped
    /// requests (`None`) see cluster bindings only.
    fn applicable_bindings<'a>(
        &'a self,
        user: &'a UserInfo,
        namespace: Option<&str>,
    ) -> impl Iterator<Item = (&'a Binding, &'a Role)> + 'a {
        let namespaced = namespace
            .and_then(|ns| self.namespaced_bindings.get(ns))
            .into_iter()
            .flatten();
        self.cluster_bindings
            .iter()
            .chain(namespaced)
            .filter(move |binding| {
                binding
                    .subjects
                    .iter()
                    .any(|subject| subject_matches(subject, &binding.scope, user))
            })
            .filter_map(move |binding| self.resolve(binding).map(|role| (binding, role)))
    }

    /// Decide a request. Denies unless some applicable binding's role
    /// carries a matching rule.
    #[instrument(skip(self, user, request), fields(subject = %user.subject))]
    pub fn authorize(&self, user: &UserInfo, request: &RequestAttributes) -> AuthorizationDecision {
        for (binding, role) in self.applicable_bindings(user, request.namespace()) {
            if let Some(rule) = role.rules.iter().find(|rule| rule_matches(rule, request)) {
                debug!(binding = %binding.name, role = %binding.role_ref, "Request allowed");
                return AuthorizationDecision::Allow {
                    grant: Grant {
                        binding: binding.name.clone(),
                        binding_scope: binding.scope.clone(),
                        role_ref: binding.role_ref.clone(),
                        rule: rule.clone(),
                    },
                };
            }
        }

        let reason = deny_reason(user, request);
        debug!(%reason, "Request denied");
        AuthorizationDecision::Deny { reason }
    }

    /// Resource request shorthand; the requester carries no extra groups
    pub fn authorize_resource(
        &self,
        subject: &Subject,
        verb: &str,
        api_group: &str,
        resource: &str,
        name: Option<&str>,
        namespace: Option<&str>,
    ) -> AuthorizationDecision {
        let user = UserInfo::new(subject.clone());
        let request = RequestAttributes::resource(verb, api_group, resource, name, namespace);
        self.authorize(&user, &request)
    }

    /// Every rule granted to the requester within `namespace`
    pub fn rules_for(&self, user: &UserInfo, namespace: Option<&str>) -> Vec<PolicyRule> {
        let mut rules: Vec<PolicyRule> = Vec::new();
        for (_, role) in self.applicable_bindings(user, namespace) {
            for rule in &role.rules {
                if !rules.contains(rule) {
                    rules.push(rule.clone());
                }
            }
        }
        rules
    }
}

fn deny_reason(user: &UserInfo, request: &RequestAttributes) -> String {
    match request {
        RequestAttributes::Resource {
            verb,
            api_group,
            resource,
            subresource,
            namespace,
            ..
        } => {
            let resource = match subresource {
                Some(sub) => format!("{}/{}", resource, sub),
                None => resource.clone(),
            };
            let group = if api_group.is_empty() { "core" } else { api_group };
            match namespace {
                Some(ns) => format!(
                    "{} cannot {} resource \"{}\" in API group \"{}\" in namespace \"{}\"",
                    user.subject, verb, resource, group, ns
                ),
                None => format!(
                    "{} cannot {} resource \"{}\" in API group \"{}\" at the cluster scope",
                    user.subject, verb, resource, group
                ),
            }
        }
        RequestAttributes::NonResource { verb, path } => {
            format!("{} cannot {} path \"{}\"", user.subject, verb, path)
        }
    }
}
