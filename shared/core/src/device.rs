use std::{fmt, ops::Deref, str::FromStr};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blob::{device_namespace, BlobRef, NAMESPACE_SEPARATOR};

/// Where an operator runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceAffinity {
    /// Host-only, outside any replica device.
    Host,
    Accelerator(usize),
}

/// Explicit (device, namespace) pair under which graph construction inserts
/// operators and mints blob names. There is no ambient scope state; every
/// construction call takes one of these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scope {
    pub device: DeviceAffinity,
    pub namespace: Option<String>,
}

impl Scope {
    /// Scope of one replica: accelerator `device`, namespace `device_<n>`.
    pub fn replica(device: usize) -> Self {
        Self {
            device: DeviceAffinity::Accelerator(device),
            namespace: Some(device_namespace(device)),
        }
    }

    pub fn host() -> Self {
        Self {
            device: DeviceAffinity::Host,
            namespace: None,
        }
    }

    /// Mints a blob name inside this scope's namespace.
    pub fn blob(&self, name: &str) -> BlobRef {
        match &self.namespace {
            Some(namespace) => BlobRef::new(format!("{namespace}{NAMESPACE_SEPARATOR}{name}")),
            None => BlobRef::new(name),
        }
    }
}

/// Ordered list of replica devices. The first entry is the master device for
/// single-host reductions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceList(Vec<usize>);

impl DeviceList {
    pub fn new(devices: Vec<usize>) -> Self {
        Self(devices)
    }

    pub fn master(&self) -> usize {
        self.0[0]
    }
}

impl Deref for DeviceList {
    type Target = [usize];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<usize>> for DeviceList {
    fn from(devices: Vec<usize>) -> Self {
        Self(devices)
    }
}

impl fmt::Display for DeviceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().map(|id| id.to_string()).join(", "))
    }
}

#[derive(Error, Debug)]
pub enum DeviceListParseError {
    #[error("no devices given in '{0}'")]
    Empty(String),

    #[error("invalid device ordinal '{0}' in '{1}'")]
    InvalidOrdinal(String, String),

    #[error("device {0} listed more than once")]
    Duplicate(usize),
}

impl FromStr for DeviceList {
    type Err = DeviceListParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut devices = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let ordinal = part.parse::<usize>().map_err(|_| {
                DeviceListParseError::InvalidOrdinal(part.to_owned(), s.to_owned())
            })?;
            if devices.contains(&ordinal) {
                return Err(DeviceListParseError::Duplicate(ordinal));
            }
            devices.push(ordinal);
        }
        if devices.is_empty() {
            return Err(DeviceListParseError::Empty(s.to_owned()));
        }
        Ok(Self(devices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_list() {
        assert_eq!("0".parse::<DeviceList>().unwrap(), DeviceList::new(vec![0]));
        assert_eq!(
            "0, 1,3".parse::<DeviceList>().unwrap(),
            DeviceList::new(vec![0, 1, 3])
        );
        assert!(matches!(
            "".parse::<DeviceList>(),
            Err(DeviceListParseError::Empty(_))
        ));
        assert!(matches!(
            "0,banana".parse::<DeviceList>(),
            Err(DeviceListParseError::InvalidOrdinal(_, _))
        ));
        assert!(matches!(
            "0,1,0".parse::<DeviceList>(),
            Err(DeviceListParseError::Duplicate(0))
        ));
        assert!("0,-1".parse::<DeviceList>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let devices = DeviceList::new(vec![0, 2, 5]);
        assert_eq!(devices.to_string(), "0, 2, 5");
        assert_eq!(devices.to_string().parse::<DeviceList>().unwrap(), devices);
    }

    #[test]
    fn test_replica_scope_mints_namespaced_blobs() {
        let scope = Scope::replica(1);
        assert_eq!(scope.device, DeviceAffinity::Accelerator(1));
        assert_eq!(scope.blob("w").as_str(), "device_1/w");
        assert_eq!(Scope::host().blob("kv").as_str(), "kv");
    }
}
