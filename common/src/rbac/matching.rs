// Subject and rule matching used by the policy evaluator

use crate::models::{PolicyRule, RequestAttributes, RoleScope, Subject, UserInfo};

/// Username prefix carried by service identities
pub const SERVICE_IDENTITY_USER_PREFIX: &str = "system:serviceaccount:";

/// Group every service identity belongs to
pub const SERVICE_IDENTITIES_GROUP: &str = "system:serviceaccounts";

pub const WILDCARD: &str = "*";

/// Namespace and name of the requester when it is a service identity,
/// either directly or through its `system:serviceaccount:ns:name` username
fn requester_service_identity(user: &UserInfo) -> Option<(&str, &str)> {
    match &user.subject {
        Subject::ServiceIdentity { namespace, name } => Some((namespace.as_str(), name.as_str())),
        Subject::User { name } => name
            .strip_prefix(SERVICE_IDENTITY_USER_PREFIX)
            .and_then(|rest| rest.split_once(':'))
            .filter(|(ns, n)| !ns.is_empty() && !n.is_empty() && !n.contains(':')),
        Subject::Group { .. } => None,
    }
}

fn requester_username(user: &UserInfo) -> Option<String> {
    match &user.subject {
        Subject::User { name } => Some(name.clone()),
        Subject::ServiceIdentity { namespace, name } => Some(format!(
            "{}{}:{}",
            SERVICE_IDENTITY_USER_PREFIX, namespace, name
        )),
        Subject::Group { .. } => None,
    }
}

fn requester_in_group(user: &UserInfo, group: &str) -> bool {
    if user.groups.contains(group) {
        return true;
    }
    if let Subject::Group { name } = &user.subject {
        if name == group {
            return true;
        }
    }
    match requester_service_identity(user) {
        Some((namespace, _)) => {
            group == SERVICE_IDENTITIES_GROUP
                || group
                    .strip_prefix(SERVICE_IDENTITIES_GROUP)
                    .and_then(|rest| rest.strip_prefix(':'))
                    .is_some_and(|ns| ns == namespace)
        }
        None => false,
    }
}

/// Does `bound`, named in a binding of `binding_scope`, cover the requester?
pub fn subject_matches(bound: &Subject, binding_scope: &RoleScope, user: &UserInfo) -> bool {
    match bound {
        Subject::User { name } => requester_username(user).is_some_and(|u| &u == name),
        Subject::Group { name } => requester_in_group(user, name),
        Subject::ServiceIdentity { namespace, name } => {
            let namespace = if namespace.is_empty() {
                match binding_scope.namespace() {
                    Some(ns) => ns,
                    None => return false,
                }
            } else {
                namespace.as_str()
            };
            requester_service_identity(user) == Some((namespace, name.as_str()))
        }
    }
}

fn contains_or_wildcard(values: &[String], wanted: &str) -> bool {
    values.iter().any(|v| v == WILDCARD || v == wanted)
}

fn resource_matches(resources: &[String], resource: &str, subresource: Option<&str>) -> bool {
    match subresource {
        None => contains_or_wildcard(resources, resource),
        Some(sub) => {
            let combined = format!("{}/{}", resource, sub);
            let any_with_sub = format!("*/{}", sub);
            resources
                .iter()
                .any(|r| r == WILDCARD || *r == combined || *r == any_with_sub)
        }
    }
}

fn resource_name_matches(resource_names: &[String], name: Option<&str>) -> bool {
    if resource_names.is_empty() {
        return true;
    }
    name.is_some_and(|n| resource_names.iter().any(|r| r == n))
}

fn non_resource_url_matches(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|pattern| {
        if pattern == WILDCARD || pattern == path {
            return true;
        }
        pattern
            .strip_suffix('*')
            .is_some_and(|prefix| path.starts_with(prefix))
    })
}

/// Does `rule` grant the request?
pub fn rule_matches(rule: &PolicyRule, request: &RequestAttributes) -> bool {
    match (rule, request) {
        (
            PolicyRule::Resource {
                api_groups,
                resources,
                resource_names,
                verbs,
            },
            RequestAttributes::Resource {
                verb,
                api_group,
                resource,
                subresource,
                name,
                ..
            },
        ) => {
            contains_or_wildcard(verbs, verb)
                && contains_or_wildcard(api_groups, api_group)
                && resource_matches(resources, resource, subresource.as_deref())
                && resource_name_matches(resource_names, name.as_deref())
        }
        (
            PolicyRule::NonResource {
                non_resource_urls,
                verbs,
            },
            RequestAttributes::NonResource { verb, path },
        ) => contains_or_wildcard(verbs, verb) && non_resource_url_matches(non_resource_urls, path),
        _ => false,
    }
}
