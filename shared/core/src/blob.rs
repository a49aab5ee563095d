use serde::{Deserialize, Serialize};
use std::fmt;

pub const NAMESPACE_SEPARATOR: char = '/';

const DEVICE_PREFIX: &str = "device_";

/// Reference to a named, device-resident value in the operator graph.
///
/// Two blobs with the same canonical suffix but different device namespaces
/// are replicas of the same logical quantity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The namespace-stripped name identifying this quantity across replicas.
    ///
    /// Format is `a/b/c/d` -> `d`.
    pub fn canonical_key(&self) -> CanonicalKey {
        match self.0.rfind(NAMESPACE_SEPARATOR) {
            Some(idx) => CanonicalKey::new(&self.0[idx + 1..]),
            None => CanonicalKey::new(&self.0),
        }
    }

    /// The device ordinal encoded in a leading `device_<n>` namespace, if any.
    pub fn device_ordinal(&self) -> Option<usize> {
        let first = self.0.split(NAMESPACE_SEPARATOR).next()?;
        first.strip_prefix(DEVICE_PREFIX)?.parse().ok()
    }

    pub fn has_device_prefix(&self) -> bool {
        self.0.starts_with(DEVICE_PREFIX)
    }

    pub fn in_namespace(&self, namespace: &str) -> bool {
        self.0.strip_prefix(namespace)
            .is_some_and(|rest| rest.starts_with(NAMESPACE_SEPARATOR))
    }

    /// Derives a sibling blob by appending `suffix` to this blob's name.
    pub fn with_suffix(&self, suffix: &str) -> BlobRef {
        BlobRef(format!("{}{}", self.0, suffix))
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlobRef {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

/// Namespace holding one replica's blobs.
pub fn device_namespace(device: usize) -> String {
    format!("{DEVICE_PREFIX}{device}")
}

/// Device-prefix-stripped name, unique per logical parameter, computed
/// quantity, or gradient.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CanonicalKey {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_key_strips_namespaces() {
        assert_eq!(
            BlobRef::from("device_0/w").canonical_key(),
            CanonicalKey::from("w")
        );
        assert_eq!(
            BlobRef::from("a/b/c/d").canonical_key(),
            CanonicalKey::from("d")
        );
        assert_eq!(
            BlobRef::from("plain").canonical_key(),
            CanonicalKey::from("plain")
        );
    }

    #[test]
    fn test_device_ordinal() {
        assert_eq!(BlobRef::from("device_3/w").device_ordinal(), Some(3));
        assert_eq!(BlobRef::from("device_12/a/b").device_ordinal(), Some(12));
        assert_eq!(BlobRef::from("gpu_0/w").device_ordinal(), None);
        assert_eq!(BlobRef::from("device_x/w").device_ordinal(), None);
        assert_eq!(BlobRef::from("w").device_ordinal(), None);
    }

    #[test]
    fn test_in_namespace() {
        let blob = BlobRef::from("device_2/x");
        assert!(blob.in_namespace("device_2"));
        assert!(!blob.in_namespace("device_1"));
        // "device_21/x" is not inside "device_2"
        assert!(!BlobRef::from("device_21/x").in_namespace("device_2"));
    }

    #[test]
    fn test_with_suffix() {
        let grad = BlobRef::from("device_0/w").with_suffix("_grad");
        assert_eq!(grad.as_str(), "device_0/w_grad");
        assert_eq!(grad.canonical_key(), CanonicalKey::from("w_grad"));
        assert_eq!(grad.device_ordinal(), Some(0));
    }
}
