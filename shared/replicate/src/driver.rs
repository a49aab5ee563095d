use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use lockstep_core::{
    device_namespace, BlobRef, DeviceList, MemoryOptimizer, ModelGraph, NetKind, Scope,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::broadcast::{broadcast_computed_params, sync_params};
use crate::gradients::add_gradient_operators;
use crate::grouping::DeviceGroupedStore;
use crate::rendezvous::{RendezvousConfig, WorldRegistry};
use crate::replica::ReplicaSet;
use crate::sync::{add_distributed_param_sync, all_reduce_gradients, SyncNets};
use crate::validate::validate_device_scopes;

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("device list is empty")]
    NoDevices,

    #[error("model already has {0} parameters, replication needs an empty model")]
    ModelNotEmpty(usize),

    #[error("forward pass on device {0} produced no losses but an update hook was supplied")]
    NoLosses(usize),

    #[error("update hook supplied but the forward pass created no parameters")]
    NoParams,

    #[error("distributed all-reduce needs more than one worker, got {0}")]
    NotEnoughWorkers(usize),
}

/// Caller-supplied graph-construction hooks, each invoked once per device
/// under that device's scope.
pub struct ReplicationHooks<'a, M> {
    /// Adds the data-loading operators. Instantiate any shared reader outside
    /// the hook so all devices read from the same source.
    pub build_inputs: Box<dyn FnMut(&mut M, &Scope) -> Result<()> + 'a>,

    /// Adds the forward pass and returns its loss blobs, in order.
    pub build_forward: Box<dyn FnMut(&mut M, &Scope) -> Result<Vec<BlobRef>> + 'a>,

    /// Adds the parameter-update operators. `lr_scale` must multiply the
    /// learning rate so results stay invariant under the total batch size,
    /// regardless of device and shard counts. Absent means a forward-only
    /// graph.
    pub build_update: Option<Box<dyn FnMut(&mut M, &Scope, f64) -> Result<()> + 'a>>,
}

#[derive(Clone)]
pub struct ParallelizeOptions {
    pub devices: DeviceList,
    pub rendezvous: Option<RendezvousConfig>,
    pub net_kind: NetKind,
    pub broadcast_computed_params: bool,
    /// Upper bound on concurrently outstanding cross-host collectives.
    pub max_inflight_collectives: usize,
    pub memory_optimizer: Option<Arc<dyn MemoryOptimizer>>,
}

impl Default for ParallelizeOptions {
    fn default() -> Self {
        Self {
            devices: DeviceList::new(vec![0]),
            rendezvous: None,
            net_kind: NetKind::Dag,
            broadcast_computed_params: true,
            max_inflight_collectives: 4,
            memory_optimizer: None,
        }
    }
}

const EXTRA_DISTRIBUTED_WORKERS: usize = 8;
const WORKERS_PER_DEVICE: usize = 4;

/// Replicates the model across `options.devices` and inserts the collective
/// operators that keep the replicas numerically identical.
///
/// Every hook runs once per device under that device's scope; after the
/// update hooks, the whole net is statically checked for operators crossing
/// device boundaries.
pub fn parallelize<M: ModelGraph>(
    model: &mut M,
    mut hooks: ReplicationHooks<'_, M>,
    options: ParallelizeOptions,
) -> Result<ReplicaSet> {
    let devices = options.devices.clone();
    if devices.is_empty() {
        return Err(ConfigurationError::NoDevices.into());
    }
    let existing = model.params().len();
    if existing != 0 {
        return Err(ConfigurationError::ModelNotEmpty(existing).into());
    }

    info!("parallelizing model for devices: {devices}");
    let extra_workers = if options.rendezvous.is_some() {
        EXTRA_DISTRIBUTED_WORKERS
    } else {
        0
    };
    {
        let net = model.net_mut();
        net.kind = options.net_kind;
        net.num_workers = devices.len() * WORKERS_PER_DEVICE + extra_workers;
    }

    debug!("creating input and forward operators");
    let mut losses_by_device = HashMap::new();
    for &device in devices.iter() {
        debug!("building replica for device {device}");
        let scope = Scope::replica(device);
        (hooks.build_inputs)(model, &scope)?;
        let losses = (hooks.build_forward)(model, &scope)?;
        if hooks.build_update.is_some() && losses.is_empty() {
            return Err(ConfigurationError::NoLosses(device).into());
        }
        losses_by_device.insert(device, losses);
    }

    let mut grouped = DeviceGroupedStore::group(&devices, &model.params())?;
    let param_keys = grouped.keys().to_vec();
    let computed = DeviceGroupedStore::group(&devices, &model.computed_params())?;
    let computed_param_keys = computed.keys().to_vec();
    grouped.merge(computed);

    let mut replica = ReplicaSet {
        devices: devices.clone(),
        rendezvous: options.rendezvous.clone(),
        grouped,
        param_keys,
        computed_param_keys,
        grad_keys: Vec::new(),
        grad_binding: Vec::new(),
        losses_by_device,
        worlds: WorldRegistry::default(),
        checkpoint_net: None,
    };

    let Some(build_update) = hooks.build_update.as_mut() else {
        info!("no update hook, leaving a forward-only graph");
        return Ok(replica);
    };
    if replica.param_keys.is_empty() {
        return Err(ConfigurationError::NoParams.into());
    }

    debug!("adding gradient operators");
    let grads = add_gradient_operators(model, &devices, &replica.losses_by_device)?;
    replica.grad_keys = grads.grouped.keys().to_vec();
    replica.grad_binding = grads.binding;
    replica.grouped.merge(grads.grouped);

    if options.broadcast_computed_params {
        broadcast_computed_params(model.net_mut(), &replica)?;
    }
    all_reduce_gradients(model, &mut replica, options.max_inflight_collectives)?;

    let shard_count = replica
        .rendezvous
        .as_ref()
        .map(|config| config.shard_count)
        .unwrap_or(1);
    let lr_scale = 1.0 / (devices.len() * shard_count) as f64;
    debug!("adding parameter update operators, lr_scale {lr_scale}");
    for &device in devices.iter() {
        build_update(model, &Scope::replica(device), lr_scale)?;
    }

    validate_device_scopes(model.net())?;

    // the first executed iteration triggers lazy allocation and communicator
    // setup, which must not race across workers
    model.net_mut().first_iter_single_worker = true;

    info!("adding initial parameter sync");
    if let Some(config) = replica.rendezvous.clone() {
        let keys = replica.param_keys.clone();
        add_distributed_param_sync(
            SyncNets::Combined(model.init_net_mut()),
            &mut replica,
            &config,
            &keys,
        )?;
    }
    sync_params(
        model.init_net_mut(),
        &replica.devices,
        &replica.grouped,
        &replica.param_keys,
    )?;

    if let Some(optimizer) = &options.memory_optimizer {
        debug!("running gradient memory optimizer");
        for &device in devices.iter() {
            if let Some(losses) = replica.losses_by_device.get(&device) {
                let losses = losses.clone();
                optimizer.share_gradient_buffers(
                    model.net_mut(),
                    &losses,
                    &device_namespace(device),
                )?;
            }
        }
    }

    Ok(replica)
}
