//! Resource keys and process identity.

use serde::{Deserialize, Serialize};

/// The (type, id) pair of the target a job acts on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: String,
    pub resource_id: String,
}

impl ResourceRef {
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Private queue of a job submitted without a resource.
    pub fn private_queue(job_id: impl std::fmt::Display) -> Self {
        Self::new(format!("{RESERVED_TYPE_PREFIX}job"), job_id.to_string())
    }

    /// Resource types starting with `@` name framework-internal queues and
    /// cannot be submitted against.
    pub fn is_reserved(&self) -> bool {
        self.resource_type.starts_with(RESERVED_TYPE_PREFIX)
    }

    /// Key of the sync queue serializing work on this resource.
    ///
    /// `:` and `\` inside either part are escaped, so distinct resources
    /// never share a key.
    pub fn queue_key(&self) -> String {
        format!(
            "{}:{}",
            escape_key_part(&self.resource_type),
            escape_key_part(&self.resource_id)
        )
    }
}

const RESERVED_TYPE_PREFIX: char = '@';

fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        if c == ':' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.resource_id)
    }
}

/// Identifier of a management-server process instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh identifier for a newly started process.
    pub fn generate() -> Self {
        Self(format!("msid-{}", ulid::Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_do_not_collide_across_separators() {
        let a = ResourceRef::new("vm:eu", "1");
        let b = ResourceRef::new("vm", "eu:1");
        assert_ne!(a.queue_key(), b.queue_key());
        assert_eq!(ResourceRef::new("vm", "42").queue_key(), "vm:42");
        assert_eq!(b.queue_key(), "vm:eu\\:1");
        assert_ne!(
            ResourceRef::new("a\\", "b").queue_key(),
            ResourceRef::new("a", "\\b").queue_key()
        );
    }

    #[test]
    fn private_queues_are_reserved() {
        let private = ResourceRef::private_queue("01J0000000000000000000000");
        assert!(private.is_reserved());
        assert!(!ResourceRef::new("job", "01J0000000000000000000000").is_reserved());
        assert_ne!(
            private.queue_key(),
            ResourceRef::new("job", "01J0000000000000000000000").queue_key()
        );
    }
}
