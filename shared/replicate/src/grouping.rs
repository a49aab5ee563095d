use std::collections::HashMap;

use lockstep_core::{device_namespace, BlobRef, CanonicalKey, Scope};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GroupingError {
    #[error("{count} blobs cannot be split evenly across {devices} devices")]
    Uneven { count: usize, devices: usize },

    #[error("blob {blob} was expected in namespace {expected}")]
    DevicePrefix { blob: BlobRef, expected: String },

    #[error("{key} has replicas on {got} of {expected} devices")]
    ReplicaMismatch {
        key: CanonicalKey,
        got: usize,
        expected: usize,
    },

    #[error("{key} is not grouped at its original insertion position")]
    Ordering { key: CanonicalKey },

    #[error("{key} has no replica on device {device}")]
    MissingReplica { key: CanonicalKey, device: usize },
}

/// Canonical key -> per-device replica handles, in key insertion order.
///
/// Built once per grouping pass during graph construction and read-only
/// afterwards; insertion order is significant, it defines the reduction order
/// downstream.
#[derive(Clone, Debug, Default)]
pub struct DeviceGroupedStore {
    keys: Vec<CanonicalKey>,
    by_key: HashMap<CanonicalKey, HashMap<usize, BlobRef>>,
}

impl DeviceGroupedStore {
    /// Groups replica blobs laid out in contiguous per-device blocks: with
    /// `n` devices, block `i` of `blobs` belongs to `devices[i]`, in the same
    /// relative order within each block.
    pub fn group(devices: &[usize], blobs: &[BlobRef]) -> Result<Self, GroupingError> {
        if devices.is_empty() || blobs.len() % devices.len() != 0 {
            return Err(GroupingError::Uneven {
                count: blobs.len(),
                devices: devices.len(),
            });
        }
        let per_device = blobs.len() / devices.len();

        let mut store = Self::default();
        for (i, blob) in blobs.iter().enumerate() {
            let device = devices[i / per_device];
            if blob.device_ordinal() != Some(device) {
                return Err(GroupingError::DevicePrefix {
                    blob: blob.clone(),
                    expected: device_namespace(device),
                });
            }

            let key = blob.canonical_key();
            if !store.by_key.contains_key(&key) {
                store.keys.push(key.clone());
            }
            store.by_key.entry(key).or_default().insert(device, blob.clone());
        }

        for key in &store.keys {
            let replicas = &store.by_key[key];
            if replicas.len() != devices.len() {
                return Err(GroupingError::ReplicaMismatch {
                    key: key.clone(),
                    got: replicas.len(),
                    expected: devices.len(),
                });
            }
        }

        // the master entry of the j-th key must be the j-th input
        for (j, key) in store.keys.iter().enumerate() {
            if store.by_key[key].get(&devices[0]) != Some(&blobs[j]) {
                return Err(GroupingError::Ordering { key: key.clone() });
            }
        }

        Ok(store)
    }

    /// Unions another grouping into this one, preserving both insertion
    /// orders. Existing keys win.
    pub fn merge(&mut self, other: DeviceGroupedStore) {
        for key in other.keys {
            if !self.by_key.contains_key(&key) {
                self.keys.push(key.clone());
                if let Some(replicas) = other.by_key.get(&key) {
                    self.by_key.insert(key, replicas.clone());
                }
            }
        }
    }

    pub fn keys(&self) -> &[CanonicalKey] {
        &self.keys
    }

    pub fn contains_key(&self, key: &CanonicalKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn blob(&self, key: &CanonicalKey, device: usize) -> Result<&BlobRef, GroupingError> {
        self.by_key
            .get(key)
            .and_then(|replicas| replicas.get(&device))
            .ok_or_else(|| GroupingError::MissingReplica {
                key: key.clone(),
                device,
            })
    }

    /// The key's replica handles in device-list order.
    pub fn replicas(
        &self,
        key: &CanonicalKey,
        devices: &[usize],
    ) -> Result<Vec<BlobRef>, GroupingError> {
        devices
            .iter()
            .map(|&device| self.blob(key, device).cloned())
            .collect()
    }

    /// Registers a quantity that was never grouped at build time (e.g. an
    /// optimizer momentum buffer) with synthesized per-device handles.
    pub fn register_synthesized(&mut self, key: CanonicalKey, devices: &[usize]) {
        if self.by_key.contains_key(&key) {
            return;
        }
        let replicas = devices
            .iter()
            .map(|&device| (device, Scope::replica(device).blob(key.as_str())))
            .collect();
        self.keys.push(key.clone());
        self.by_key.insert(key, replicas);
    }
}
