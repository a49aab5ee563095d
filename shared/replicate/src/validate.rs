use lockstep_core::{device_namespace, DeviceAffinity, Net};
use thiserror::Error;

/// A non-collective, non-copy operator touched a blob tagged for a different
/// device than the one it runs on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("blob {blob} of {op} operator should be in namespace {expected}")]
pub struct ScopeViolation {
    pub blob: String,
    pub op: String,
    pub expected: String,
}

/// Static post-build check that no operator crosses its device boundary.
///
/// Collectives and copies legitimately span devices, and host-only operators
/// sit outside replica namespaces entirely; everything else must only touch
/// blobs in its own device's namespace.
pub fn validate_device_scopes(net: &Net) -> Result<(), ScopeViolation> {
    for op in net.ops() {
        if op.kind.is_collective() || op.kind.is_copy() {
            continue;
        }
        let device = match op.device {
            DeviceAffinity::Host => continue,
            DeviceAffinity::Accelerator(device) => device,
        };
        let namespace = device_namespace(device);
        for blob in op.inputs.iter().chain(op.outputs.iter()) {
            if blob.has_device_prefix() && !blob.in_namespace(&namespace) {
                return Err(ScopeViolation {
                    blob: blob.to_string(),
                    op: op.kind.name().to_owned(),
                    expected: namespace,
                });
            }
        }
    }
    Ok(())
}
