use std::collections::HashMap;

use anyhow::Result;
use lockstep_core::{BlobRef, CanonicalKey, ModelGraph, Scope};
use tracing::debug;

use crate::grouping::DeviceGroupedStore;

pub(crate) struct GradientInfo {
    pub grouped: DeviceGroupedStore,
    /// Canonical param -> gradient pairs in parameter creation order,
    /// restricted to parameters that actually received a gradient.
    pub binding: Vec<(CanonicalKey, CanonicalKey)>,
}

/// Seeds each loss with a constant-1 gradient under its device's scope, asks
/// the model to emit its gradient operators, and groups the resulting gradient
/// blobs by canonical gradient name.
pub(crate) fn add_gradient_operators<M: ModelGraph>(
    model: &mut M,
    devices: &[usize],
    losses_by_device: &HashMap<usize, Vec<BlobRef>>,
) -> Result<GradientInfo> {
    let mut loss_seeds = HashMap::new();
    for &device in devices {
        let scope = Scope::replica(device);
        let losses = losses_by_device.get(&device).cloned().unwrap_or_default();
        for loss in losses {
            let seed = loss.with_suffix("_grad");
            model
                .net_mut()
                .constant_fill(&scope, Some(&loss), seed.clone(), 1.0, None);
            loss_seeds.insert(loss, seed);
        }
    }

    let param_to_grad = model.emit_gradient_ops(&loss_seeds)?;

    let params = model.params();
    let grads_ordered: Vec<BlobRef> = params
        .iter()
        .filter_map(|param| param_to_grad.get(param).cloned())
        .collect();
    let grouped = DeviceGroupedStore::group(devices, &grads_ordered)?;

    let mut binding: Vec<(CanonicalKey, CanonicalKey)> = Vec::new();
    for param in &params {
        if let Some(grad) = param_to_grad.get(param) {
            let key = param.canonical_key();
            if binding.iter().any(|(bound, _)| bound == &key) {
                continue;
            }
            binding.push((key, grad.canonical_key()));
        }
    }

    debug!(
        "bound {} gradients across {} devices",
        grouped.keys().len(),
        devices.len()
    );
    Ok(GradientInfo { grouped, binding })
}
