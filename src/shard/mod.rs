// Shard-group identity and naming (§4.7).
//
// A shard group is identified by `(data_element, hash_range_start)`. Its
// three deployments/services are named deterministically so the lifecycle
// manager and the split orchestrator can address them without a lookup
// table.

pub mod config;
pub mod k8s;
pub mod lifecycle;

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataElement {
    User,
    Group,
    GroupToGroupMapping,
}

impl DataElement {
    fn as_lower(&self) -> &'static str {
        match self {
            DataElement::User => "user",
            DataElement::Group => "group",
            DataElement::GroupToGroupMapping => "grouptogroupmapping",
        }
    }
}

impl fmt::Display for DataElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_lower())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardRole {
    EventCache,
    Reader,
    Writer,
}

impl ShardRole {
    fn as_lower(&self) -> &'static str {
        match self {
            ShardRole::EventCache => "eventcache",
            ShardRole::Reader => "reader",
            ShardRole::Writer => "writer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardGroupId {
    pub element: DataElement,
    pub hash_range_start: i32,
}

/// Decimal form of a `hash_range_start`, with a leading `-` replaced by
/// `n` so it is valid in a Kubernetes resource name.
pub fn hash_range_string(hash_range_start: i32) -> String {
    let raw = hash_range_start.to_string();
    match raw.strip_prefix('-') {
        Some(digits) => format!("n{digits}"),
        None => raw,
    }
}

/// `<element-lower>-<role-lower>-<hash>`, e.g. `user-writer-n2147483648`.
pub fn deployment_name(element: DataElement, role: ShardRole, hash_range_start: i32) -> String {
    format!("{}-{}-{}", element.as_lower(), role.as_lower(), hash_range_string(hash_range_start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_hash_range_start_uses_n_prefix() {
        assert_eq!(hash_range_string(i32::MIN), "n2147483648");
    }

    #[test]
    fn positive_hash_range_start_is_left_alone() {
        assert_eq!(hash_range_string(0), "0");
        assert_eq!(hash_range_string(42), "42");
    }

    #[test]
    fn deployment_name_matches_the_spec_example() {
        assert_eq!(
            deployment_name(DataElement::User, ShardRole::Writer, i32::MIN),
            "user-writer-n2147483648"
        );
    }
}
