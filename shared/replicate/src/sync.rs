use anyhow::Result;
use lockstep_core::{
    BlobRef, CanonicalKey, DeviceAffinity, ModelGraph, Net, OpKind, OperatorDef, Scope,
    TransportEngine,
};
use tracing::debug;

use crate::driver::ConfigurationError;
use crate::grouping::GroupingError;
use crate::rendezvous::{RendezvousConfig, WorldKey};
use crate::replica::ReplicaSet;
use crate::broadcast;

/// Where the distributed parameter sync places its operators.
pub(crate) enum SyncNets<'a> {
    /// World formation and sync ops share one net.
    Combined(&'a mut Net),
    /// World formation runs once in `init`; sync ops land in `run`.
    Split { init: &'a mut Net, run: &'a mut Net },
}

impl SyncNets<'_> {
    fn init(&mut self) -> &mut Net {
        match self {
            SyncNets::Combined(net) => net,
            SyncNets::Split { init, .. } => init,
        }
    }

    fn run(&mut self) -> &mut Net {
        match self {
            SyncNets::Combined(net) => net,
            SyncNets::Split { run, .. } => run,
        }
    }
}

/// Makes every device's gradients identical across the group, strategy chosen
/// by the presence of a rendezvous config.
pub(crate) fn all_reduce_gradients<M: ModelGraph>(
    model: &mut M,
    replica: &mut ReplicaSet,
    max_inflight: usize,
) -> Result<()> {
    match replica.rendezvous.clone() {
        None => all_reduce_gradients_single_host(model.net_mut(), replica)?,
        Some(config) => {
            all_reduce_gradients_distributed(model, replica, &config, max_inflight)?
        }
    }
    Ok(())
}

/// One group-wide in-place all-reduce per gradient, in reduction order.
///
/// The group collective shares one communication context across the worker
/// pool; successive reductions must be totally ordered through the chain
/// token or the executor's threads race on it.
fn all_reduce_gradients_single_host(
    net: &mut Net,
    replica: &ReplicaSet,
) -> Result<(), GroupingError> {
    if replica.devices.len() == 1 {
        return Ok(());
    }

    let master = replica.devices.master();
    let mut chain: Option<BlobRef> = None;
    for key in replica.reduction_order() {
        let group = replica.grouped.replicas(&key, &replica.devices)?;
        net.push(OperatorDef {
            kind: OpKind::DeviceAllReduce,
            inputs: group.clone(),
            outputs: group.clone(),
            device: DeviceAffinity::Accelerator(master),
            control_inputs: chain.iter().cloned().collect(),
        });
        chain = Some(group[0].clone());
    }
    Ok(())
}

/// Per gradient, in reduction order: reduce locally onto the host-master
/// device, all-reduce across hosts on that gradient's common world, copy the
/// result back and broadcast it to the local replicas.
///
/// Cross-host collectives get their ordering from a bounded cyclic window of
/// prior reduced blobs instead of one global chain: every host must issue the
/// same collectives, and the window caps how many may be outstanding at once
/// while still letting independent reductions overlap.
fn all_reduce_gradients_distributed<M: ModelGraph>(
    model: &mut M,
    replica: &mut ReplicaSet,
    config: &RendezvousConfig,
    max_inflight: usize,
) -> Result<()> {
    let num_workers = model.net().num_workers;
    if num_workers < 2 {
        return Err(ConfigurationError::NotEnoughWorkers(num_workers).into());
    }

    let master = replica.devices.master();
    let master_scope = Scope::replica(master);
    let host_scope = Scope::host();
    let reducing_scope = match config.engine {
        TransportEngine::Device => master_scope.clone(),
        TransportEngine::HostStaged => host_scope.clone(),
    };

    let window = max_inflight.min(config.shard_count.saturating_sub(1));
    debug!(
        "cross-host all-reduce window: {window} ({} gradients)",
        replica.grad_keys.len()
    );
    let mut inflight: Vec<BlobRef> = Vec::with_capacity(window);
    let mut counter = 0;
    let mut local_chain: Option<BlobRef> = None;

    for key in replica.reduction_order() {
        let master_grad = replica.grouped.blob(&key, master)?.clone();
        let group = replica.grouped.replicas(&key, &replica.devices)?;

        // the group reduction is in-place, so the cross-host stage works on a
        // zeroed scratch copy of the master gradient
        let reduced = master_grad.with_suffix("_red");
        model
            .net_mut()
            .constant_fill(&master_scope, Some(&master_grad), reduced.clone(), 0.0, None);
        model.net_mut().push(OperatorDef {
            kind: OpKind::DeviceAllReduce,
            inputs: group.clone(),
            outputs: group.clone(),
            device: master_scope.device,
            control_inputs: local_chain.iter().cloned().collect(),
        });
        local_chain = Some(group[0].clone());
        model.net_mut().copy(&master_scope, &master_grad, &reduced);

        let scratch = match config.engine {
            TransportEngine::Device => reduced.clone(),
            TransportEngine::HostStaged => {
                // the host buffer is lazily allocated; it must already hold a
                // value when the first timed sync touches it
                let host_blob = reduced.with_suffix("_host");
                model.init_net_mut().constant_fill(
                    &host_scope,
                    None,
                    host_blob.clone(),
                    0.0,
                    Some(vec![1]),
                );
                if let Some(param_key) = replica.param_of_grad(&key) {
                    let param = replica.grouped.blob(param_key, master)?.clone();
                    model
                        .init_net_mut()
                        .copy_to_host(&master_scope, &param, &host_blob);
                }
                model
                    .net_mut()
                    .copy_to_host(&master_scope, &reduced, &host_blob);
                host_blob
            }
        };

        let world = replica.worlds.get_or_create(
            WorldKey::Gradient(key.clone()),
            model.init_net_mut(),
            &reducing_scope,
            config,
        );

        let control = if window == 0 || inflight.len() < window {
            None
        } else {
            Some(inflight[counter % window].clone())
        };
        model.net_mut().push(OperatorDef {
            kind: OpKind::WorldAllReduce {
                engine: config.engine,
            },
            inputs: vec![world, scratch.clone()],
            outputs: vec![scratch.clone()],
            device: reducing_scope.device,
            control_inputs: control.into_iter().collect(),
        });

        match config.engine {
            TransportEngine::Device => {
                model.net_mut().copy(&master_scope, &scratch, &master_grad)
            }
            TransportEngine::HostStaged => model
                .net_mut()
                .copy_from_host(&master_scope, &scratch, &master_grad),
        }

        if window > 0 {
            if inflight.len() < window {
                inflight.push(scratch);
            } else {
                inflight[counter % window] = scratch;
            }
            counter += 1;
        }

        broadcast::broadcast(model.net_mut(), &replica.devices, &replica.grouped, &key)?;
    }
    Ok(())
}

/// One-shot cross-host parameter sync: the iteration counter over its own
/// dedicated world, then each of `keys` staged through host memory and
/// broadcast from shard 0.
pub(crate) fn add_distributed_param_sync(
    mut nets: SyncNets<'_>,
    replica: &mut ReplicaSet,
    config: &RendezvousConfig,
    keys: &[CanonicalKey],
) -> Result<(), GroupingError> {
    let master = replica.devices.master();
    let master_scope = Scope::replica(master);
    let host_scope = Scope::host();

    // the counter drives checkpoint naming and LR schedules; it has to agree
    // across hosts before anything else is synchronized
    let iter_blob = replica.iteration_counter(master);
    let world =
        replica
            .worlds
            .get_or_create(WorldKey::IterationCounter, nets.init(), &host_scope, config);
    nets.run().push(OperatorDef {
        kind: OpKind::WorldBroadcast {
            engine: config.engine,
        },
        inputs: vec![world, iter_blob.clone()],
        outputs: vec![iter_blob],
        device: DeviceAffinity::Host,
        control_inputs: Vec::new(),
    });

    // sorted so every host lays identical ops in identical order
    let mut sorted = keys.to_vec();
    sorted.sort();
    for key in &sorted {
        let param = replica.grouped.blob(key, master)?.clone();
        let host_copy = param.with_suffix("_host");
        nets.run().copy_to_host(&master_scope, &param, &host_copy);

        let world = replica.worlds.get_or_create(
            WorldKey::Param(key.clone()),
            nets.init(),
            &host_scope,
            config,
        );
        nets.run().push(OperatorDef {
            kind: OpKind::WorldBroadcast {
                engine: config.engine,
            },
            inputs: vec![world, host_copy.clone()],
            outputs: vec![host_copy.clone()],
            device: DeviceAffinity::Host,
            control_inputs: Vec::new(),
        });
        nets.run().copy_from_host(&master_scope, &host_copy, &param);
    }
    Ok(())
}
