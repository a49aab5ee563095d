use std::collections::HashMap;

use lockstep_core::{BlobRef, CanonicalKey, DeviceList, Net, Scope};

use crate::grouping::DeviceGroupedStore;
use crate::rendezvous::{RendezvousConfig, WorldRegistry};

/// Canonical name of the training-iteration counter. It lives in host memory
/// under the master device's namespace, outside the grouped store.
pub const ITERATION_COUNTER: &str = "iter";

/// Everything the synchronization passes need to know about one replicated
/// model, owned for exactly the training graph's lifetime.
///
/// Built by [`parallelize`](crate::parallelize) and read-only afterwards,
/// except for the memoized world registry and the lazily built checkpoint net.
#[derive(Debug)]
pub struct ReplicaSet {
    pub(crate) devices: DeviceList,
    pub(crate) rendezvous: Option<RendezvousConfig>,
    pub(crate) grouped: DeviceGroupedStore,
    pub(crate) param_keys: Vec<CanonicalKey>,
    pub(crate) computed_param_keys: Vec<CanonicalKey>,
    pub(crate) grad_keys: Vec<CanonicalKey>,
    pub(crate) grad_binding: Vec<(CanonicalKey, CanonicalKey)>,
    pub(crate) losses_by_device: HashMap<usize, Vec<BlobRef>>,
    pub(crate) worlds: WorldRegistry,
    pub(crate) checkpoint_net: Option<Net>,
}

impl ReplicaSet {
    pub fn devices(&self) -> &DeviceList {
        &self.devices
    }

    pub fn is_distributed(&self) -> bool {
        self.rendezvous.is_some()
    }

    pub fn grouped(&self) -> &DeviceGroupedStore {
        &self.grouped
    }

    pub fn param_keys(&self) -> &[CanonicalKey] {
        &self.param_keys
    }

    pub fn computed_param_keys(&self) -> &[CanonicalKey] {
        &self.computed_param_keys
    }

    /// Gradient keys in insertion (creation) order.
    pub fn grad_keys(&self) -> &[CanonicalKey] {
        &self.grad_keys
    }

    /// Canonical parameter -> gradient binding, one entry per parameter that
    /// actually received a gradient, in parameter creation order.
    pub fn grad_binding(&self) -> &[(CanonicalKey, CanonicalKey)] {
        &self.grad_binding
    }

    pub fn losses(&self, device: usize) -> &[BlobRef] {
        self.losses_by_device
            .get(&device)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Gradients in reverse creation order. Gradients of layers nearest the
    /// loss are ready first during backpropagation, so reducing in this order
    /// overlaps their communication with the rest of the backward pass.
    pub fn reduction_order(&self) -> Vec<CanonicalKey> {
        self.grad_keys.iter().rev().cloned().collect()
    }

    /// The iteration-counter blob on `device`.
    pub fn iteration_counter(&self, device: usize) -> BlobRef {
        Scope::replica(device).blob(ITERATION_COUNTER)
    }

    pub fn worlds(&self) -> &WorldRegistry {
        &self.worlds
    }

    /// Whether the checkpoint synchronization net has been built yet.
    pub fn has_checkpoint_net(&self) -> bool {
        self.checkpoint_net.is_some()
    }

    pub(crate) fn param_of_grad(&self, grad: &CanonicalKey) -> Option<&CanonicalKey> {
        self.grad_binding
            .iter()
            .find(|(_, bound)| bound == grad)
            .map(|(param, _)| param)
    }
}
