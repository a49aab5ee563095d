use anyhow::Result;
use clap::Parser;
use lockstep_core::{BlobRef, DeviceList, ModelGraph, NetKind, Scope, TransportEngine};
use lockstep_replicate::{
    parallelize, DummyModel, ParallelizeOptions, RendezvousConfig, ReplicationHooks,
};
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// Replica devices, e.g. "0,1"
    #[arg(long, default_value = "0,1")]
    devices: DeviceList,

    /// Number of hosts in the run; more than one enables the rendezvous path
    #[arg(long, default_value_t = 1)]
    shards: usize,

    /// This host's rank among the shards
    #[arg(long, default_value_t = 0)]
    shard_id: usize,

    /// Build a sequential net instead of a parallel DAG
    #[arg(long)]
    sequential: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let rendezvous = (args.shards > 1).then(|| RendezvousConfig {
        kv_handler: BlobRef::from("kv_handler"),
        shard_count: args.shards,
        shard_id: args.shard_id,
        engine: TransportEngine::HostStaged,
    });

    let options = ParallelizeOptions {
        devices: args.devices,
        rendezvous,
        net_kind: if args.sequential {
            NetKind::Simple
        } else {
            NetKind::Dag
        },
        ..Default::default()
    };

    let hooks = ReplicationHooks {
        build_inputs: Box::new(|model: &mut DummyModel, scope: &Scope| {
            model.add_compute(scope, "LoadData", &[], "data");
            Ok(())
        }),
        build_forward: Box::new(|model, scope| {
            let data = scope.blob("data");
            let w = model.add_param(scope, "fc_w");
            let b = model.add_param(scope, "fc_b");
            model.add_computed_param(scope, "running_mean");
            let fc = model.add_compute(scope, "FullyConnected", &[data, w, b], "fc");
            let loss = model.add_compute(scope, "AveragedLoss", &[fc], "loss");
            Ok(vec![loss])
        }),
        build_update: Some(Box::new(|model, scope, lr_scale| {
            info!("update ops for {:?} with lr_scale {lr_scale}", scope.device);
            let w = scope.blob("fc_w");
            let w_grad = scope.blob("fc_w_grad");
            let b = scope.blob("fc_b");
            let b_grad = scope.blob("fc_b_grad");
            model.add_compute(scope, "WeightedSum", &[w, w_grad], "fc_w");
            model.add_compute(scope, "WeightedSum", &[b, b_grad], "fc_b");
            Ok(())
        })),
    };

    let mut model = DummyModel::new();
    let replica = parallelize(&mut model, hooks, options)?;

    info!(
        "built training net with {} ops ({} workers), init net with {} ops",
        model.net().ops().len(),
        model.net().num_workers,
        model.init_net().ops().len(),
    );
    info!(
        "replicated {} params, {} computed params, {} gradients across devices [{}]",
        replica.param_keys().len(),
        replica.computed_param_keys().len(),
        replica.grad_keys().len(),
        replica.devices(),
    );
    for (param, grad) in replica.grad_binding() {
        info!("  {param} -> {grad}");
    }

    Ok(())
}
