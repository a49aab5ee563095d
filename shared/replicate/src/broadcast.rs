use lockstep_core::{CanonicalKey, Net, Scope};
use tracing::warn;

use crate::grouping::{DeviceGroupedStore, GroupingError};
use crate::replica::ReplicaSet;

/// Copies `key`'s master-device value to every other replica: one copy op per
/// target device, inserted under the target's scope. A direct multi-device
/// broadcast primitive is unreliable in this backend, point-to-point copies
/// are not.
pub fn broadcast(
    net: &mut Net,
    devices: &[usize],
    grouped: &DeviceGroupedStore,
    key: &CanonicalKey,
) -> Result<(), GroupingError> {
    let master = devices[0];
    let source = grouped.blob(key, master)?.clone();
    for &device in &devices[1..] {
        let target = grouped.blob(key, device)?.clone();
        net.copy(&Scope::replica(device), &source, &target);
    }
    Ok(())
}

/// Master-to-replica broadcast of each of `keys`, in order.
pub(crate) fn sync_params(
    net: &mut Net,
    devices: &[usize],
    grouped: &DeviceGroupedStore,
    keys: &[CanonicalKey],
) -> Result<(), GroupingError> {
    for key in keys {
        broadcast(net, devices, grouped, key)?;
    }
    Ok(())
}

/// Synchronizes computed (non-trainable) quantities by broadcasting the master
/// device's value. Averaging is avoided: the group collective is prone to
/// stalling under certain device-driver conditions.
pub(crate) fn broadcast_computed_params(
    net: &mut Net,
    replica: &ReplicaSet,
) -> Result<(), GroupingError> {
    if replica.rendezvous.is_some() {
        warn!("distributed computed-param averaging not implemented, broadcasting locally only");
    }
    if replica.devices.len() == 1 {
        return Ok(());
    }
    for key in &replica.computed_param_keys {
        broadcast(net, &replica.devices, &replica.grouped, key)?;
    }
    Ok(())
}
