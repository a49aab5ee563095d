use std::sync::{Arc, Mutex};

use lockstep_core::{
    BlobRef, CanonicalKey, DeviceAffinity, DeviceList, ModelGraph, OpKind, Scope, TransportEngine,
};
use lockstep_replicate::{
    parallelize, ConfigurationError, DummyExecutor, DummyModel, ParallelizeOptions,
    RendezvousConfig, ReplicationHooks, CHECKPOINT_SYNC_NET,
};

fn options(devices: Vec<usize>) -> ParallelizeOptions {
    ParallelizeOptions {
        devices: DeviceList::new(devices),
        ..Default::default()
    }
}

fn distributed_options(devices: Vec<usize>, engine: TransportEngine) -> ParallelizeOptions {
    ParallelizeOptions {
        devices: DeviceList::new(devices),
        rendezvous: Some(RendezvousConfig {
            kv_handler: BlobRef::from("kv_handler"),
            shard_count: 2,
            shard_id: 0,
            engine,
        }),
        ..Default::default()
    }
}

/// One parameter, one computed quantity, one loss per device.
fn simple_hooks<'a>(lr_seen: Arc<Mutex<Vec<f64>>>) -> ReplicationHooks<'a, DummyModel> {
    ReplicationHooks {
        build_inputs: Box::new(|model, scope| {
            model.add_compute(scope, "LoadData", &[], "data");
            Ok(())
        }),
        build_forward: Box::new(|model, scope| {
            let data = scope.blob("data");
            let w = model.add_param(scope, "w");
            model.add_computed_param(scope, "running_mean");
            let fc = model.add_compute(scope, "FullyConnected", &[data, w], "fc");
            let loss = model.add_compute(scope, "AveragedLoss", &[fc], "loss");
            Ok(vec![loss])
        }),
        build_update: Some(Box::new(move |model, scope, lr_scale| {
            lr_seen.lock().unwrap().push(lr_scale);
            let w = scope.blob("w");
            let w_grad = scope.blob("w_grad");
            model.add_compute(scope, "WeightedSum", &[w, w_grad], "w");
            Ok(())
        })),
    }
}

#[test]
fn test_end_to_end_single_host() {
    let lr_seen = Arc::new(Mutex::new(Vec::new()));
    let mut model = DummyModel::new();
    let replica = parallelize(
        &mut model,
        simple_hooks(lr_seen.clone()),
        options(vec![0, 1]),
    )
    .unwrap();

    assert_eq!(
        replica.grad_binding(),
        &[(CanonicalKey::from("w"), CanonicalKey::from("w_grad"))][..]
    );
    assert_eq!(
        replica
            .grouped()
            .replicas(&CanonicalKey::from("w_grad"), replica.devices())
            .unwrap()
            .len(),
        2
    );

    // exactly one group all-reduce, over both replicas of w_grad
    let reduces: Vec<_> = model
        .net()
        .ops()
        .iter()
        .filter(|op| op.kind == OpKind::DeviceAllReduce)
        .collect();
    assert_eq!(reduces.len(), 1);
    assert_eq!(
        reduces[0].inputs,
        vec![BlobRef::from("device_0/w_grad"), BlobRef::from("device_1/w_grad")]
    );

    // exactly one broadcast copy, for the computed quantity
    let copies: Vec<_> = model
        .net()
        .ops()
        .iter()
        .filter(|op| op.kind == OpKind::Copy)
        .collect();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].inputs[0].as_str(), "device_0/running_mean");
    assert_eq!(copies[0].outputs[0].as_str(), "device_1/running_mean");

    // scaled for 2 devices, 1 shard
    assert_eq!(*lr_seen.lock().unwrap(), vec![0.5, 0.5]);

    assert_eq!(model.net().num_workers, 8);
    assert!(model.net().first_iter_single_worker);

    // initial parameter sync in the init net
    assert!(model.init_net().ops().iter().any(|op| op.kind == OpKind::Copy
        && op.inputs[0].as_str() == "device_0/w"
        && op.outputs[0].as_str() == "device_1/w"));
}

#[test]
fn test_forward_only_adds_no_collectives() {
    let mut model = DummyModel::new();
    let hooks = ReplicationHooks {
        build_inputs: Box::new(|model: &mut DummyModel, scope: &Scope| {
            model.add_compute(scope, "LoadData", &[], "data");
            Ok(())
        }),
        build_forward: Box::new(|model, scope| {
            let data = scope.blob("data");
            model.add_param(scope, "w");
            model.add_compute(scope, "FullyConnected", &[data], "out");
            Ok(Vec::new())
        }),
        build_update: None,
    };
    let replica = parallelize(&mut model, hooks, options(vec![0, 1])).unwrap();

    assert!(replica.grad_keys().is_empty());
    assert!(!model
        .net()
        .ops()
        .iter()
        .any(|op| op.kind.is_collective()));
}

#[test]
fn test_reduction_order_reverses_binding_order() {
    let mut model = DummyModel::new();
    let hooks = ReplicationHooks {
        build_inputs: Box::new(|_model: &mut DummyModel, _scope: &Scope| Ok(())),
        build_forward: Box::new(|model, scope| {
            model.add_param(scope, "w1");
            let frozen = model.add_param(scope, "w2");
            model.freeze(&frozen);
            model.add_param(scope, "w3");
            let loss = model.add_compute(scope, "Loss", &[], "loss");
            Ok(vec![loss])
        }),
        build_update: Some(Box::new(|_model, _scope, _lr_scale| Ok(()))),
    };
    let replica = parallelize(&mut model, hooks, options(vec![0, 1])).unwrap();

    // w2 received no gradient and stays out of the binding
    assert_eq!(
        replica.grad_binding(),
        &[
            (CanonicalKey::from("w1"), CanonicalKey::from("w1_grad")),
            (CanonicalKey::from("w3"), CanonicalKey::from("w3_grad")),
        ][..]
    );
    assert_eq!(
        replica.reduction_order(),
        vec![CanonicalKey::from("w3_grad"), CanonicalKey::from("w1_grad")]
    );

    // the inserted reductions follow that order
    let reduces: Vec<_> = model
        .net()
        .ops()
        .iter()
        .filter(|op| op.kind == OpKind::DeviceAllReduce)
        .collect();
    assert_eq!(reduces.len(), 2);
    assert_eq!(reduces[0].inputs[0].as_str(), "device_0/w3_grad");
    assert_eq!(reduces[1].inputs[0].as_str(), "device_0/w1_grad");
}

#[test]
fn test_distributed_build_forms_worlds_and_stages_through_host() {
    let lr_seen = Arc::new(Mutex::new(Vec::new()));
    let mut model = DummyModel::new();
    let replica = parallelize(
        &mut model,
        simple_hooks(lr_seen.clone()),
        distributed_options(vec![0, 1], TransportEngine::HostStaged),
    )
    .unwrap();
    assert!(replica.is_distributed());

    // 2 devices, distributed: 2 * 4 + 8
    assert_eq!(model.net().num_workers, 16);
    // scaled for 2 devices * 2 shards
    assert_eq!(*lr_seen.lock().unwrap(), vec![0.25, 0.25]);

    // worlds form in the init net: the gradient's during the all-reduce pass,
    // then the counter's and the parameter's during the initial sync
    let worlds: Vec<_> = model
        .init_net()
        .ops()
        .iter()
        .filter_map(|op| match &op.kind {
            OpKind::CreateCommonWorld { world, .. } => Some(world.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(worlds, vec!["w_grad_cw", "iter_cw", "w_cw"]);

    // one cross-host all-reduce on the host-staged scratch
    let world_reduces: Vec<_> = model
        .net()
        .ops()
        .iter()
        .filter(|op| matches!(op.kind, OpKind::WorldAllReduce { .. }))
        .collect();
    assert_eq!(world_reduces.len(), 1);
    assert_eq!(
        world_reduces[0].inputs[1].as_str(),
        "device_0/w_grad_red_host"
    );

    // the reduced gradient fans back out to the other local device
    assert!(model.net().ops().iter().any(|op| op.kind == OpKind::Copy
        && op.inputs[0].as_str() == "device_0/w_grad"
        && op.outputs[0].as_str() == "device_1/w_grad"));

    // initial parameter sync broadcasts the counter and the host-staged param
    let broadcasts: Vec<_> = model
        .init_net()
        .ops()
        .iter()
        .filter(|op| matches!(op.kind, OpKind::WorldBroadcast { .. }))
        .collect();
    assert_eq!(broadcasts.len(), 2);
    assert_eq!(broadcasts[0].inputs[1].as_str(), "device_0/iter");
    assert_eq!(broadcasts[0].device, DeviceAffinity::Host);
    assert_eq!(broadcasts[1].inputs[1].as_str(), "device_0/w_host");
}

#[test]
fn test_checkpoint_net_is_built_once_and_run_every_time() {
    let lr_seen = Arc::new(Mutex::new(Vec::new()));
    let mut model = DummyModel::new();
    let mut replica = parallelize(
        &mut model,
        simple_hooks(lr_seen),
        options(vec![0, 1]),
    )
    .unwrap();

    // the momentum buffer was never grouped during the build
    let blobs = vec![
        BlobRef::from("device_0/w"),
        BlobRef::from("device_1/w"),
        BlobRef::from("device_0/momentum"),
        BlobRef::from("device_1/momentum"),
    ];

    let mut executor = DummyExecutor::default();
    replica
        .finalize_after_checkpoint(&blobs, true, &mut executor)
        .unwrap();
    assert!(replica.has_checkpoint_net());
    assert_eq!(executor.created.len(), 1);
    assert_eq!(executor.runs, vec![CHECKPOINT_SYNC_NET]);

    replica
        .finalize_after_checkpoint(&blobs, true, &mut executor)
        .unwrap();
    assert_eq!(executor.created.len(), 1, "sync net must be built only once");
    assert_eq!(executor.runs.len(), 2);

    let sync_net = &executor.created[0];
    // the unknown blob was auto-registered and is broadcast like the rest
    assert!(sync_net.ops().iter().any(|op| op.kind == OpKind::Copy
        && op.inputs[0].as_str() == "device_0/momentum"
        && op.outputs[0].as_str() == "device_1/momentum"));
    // the counter is copied host-side to the non-master device
    assert!(sync_net.ops().iter().any(|op| op.kind == OpKind::Copy
        && op.device == DeviceAffinity::Host
        && op.inputs[0].as_str() == "device_0/iter"
        && op.outputs[0].as_str() == "device_1/iter"));
}

#[test]
fn test_distributed_checkpoint_reuses_memoized_worlds() {
    let lr_seen = Arc::new(Mutex::new(Vec::new()));
    let mut model = DummyModel::new();
    let mut replica = parallelize(
        &mut model,
        simple_hooks(lr_seen),
        distributed_options(vec![0, 1], TransportEngine::Device),
    )
    .unwrap();

    let blobs = vec![
        BlobRef::from("device_0/w"),
        BlobRef::from("device_1/w"),
        BlobRef::from("device_0/momentum"),
        BlobRef::from("device_1/momentum"),
    ];
    let mut executor = DummyExecutor::default();
    replica
        .finalize_after_checkpoint(&blobs, true, &mut executor)
        .unwrap();

    // the one-shot init net ran immediately, forming only the world that was
    // not already formed during the training build
    assert_eq!(executor.ran_once.len(), 1);
    let init_worlds: Vec<_> = executor.ran_once[0]
        .ops()
        .iter()
        .filter_map(|op| match &op.kind {
            OpKind::CreateCommonWorld { world, .. } => Some(world.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(init_worlds, vec!["momentum_cw"]);

    // the sync net still broadcasts the counter and both quantities
    let sync_net = &executor.created[0];
    let broadcasts = sync_net
        .ops()
        .iter()
        .filter(|op| matches!(op.kind, OpKind::WorldBroadcast { .. }))
        .count();
    assert_eq!(broadcasts, 3);
}

#[test]
fn test_configuration_errors() {
    // empty device list
    let lr_seen = Arc::new(Mutex::new(Vec::new()));
    let mut model = DummyModel::new();
    let err = parallelize(&mut model, simple_hooks(lr_seen.clone()), options(vec![])).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigurationError>(),
        Some(ConfigurationError::NoDevices)
    ));

    // model must be empty before replication
    let mut model = DummyModel::new();
    model.add_param(&Scope::replica(0), "stale");
    let err = parallelize(&mut model, simple_hooks(lr_seen.clone()), options(vec![0])).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigurationError>(),
        Some(ConfigurationError::ModelNotEmpty(1))
    ));

    // an update hook needs at least one loss per device
    let mut model = DummyModel::new();
    let hooks = ReplicationHooks {
        build_inputs: Box::new(|_model: &mut DummyModel, _scope: &Scope| Ok(())),
        build_forward: Box::new(|model, scope| {
            model.add_param(scope, "w");
            Ok(Vec::new())
        }),
        build_update: Some(Box::new(|_model, _scope, _lr_scale| Ok(()))),
    };
    let err = parallelize(&mut model, hooks, options(vec![0, 1])).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigurationError>(),
        Some(ConfigurationError::NoLosses(0))
    ));

    // an update hook needs parameters to update
    let mut model = DummyModel::new();
    let hooks = ReplicationHooks {
        build_inputs: Box::new(|_model: &mut DummyModel, _scope: &Scope| Ok(())),
        build_forward: Box::new(|model, scope| {
            let loss = model.add_compute(scope, "Loss", &[], "loss");
            Ok(vec![loss])
        }),
        build_update: Some(Box::new(|_model, _scope, _lr_scale| Ok(()))),
    };
    let err = parallelize(&mut model, hooks, options(vec![0])).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigurationError>(),
        Some(ConfigurationError::NoParams)
    ));
}

#[test]
fn test_replica_graphs_must_match_across_devices() {
    // device 1 creates a differently named parameter than device 0
    let mut model = DummyModel::new();
    let hooks = ReplicationHooks {
        build_inputs: Box::new(|_model: &mut DummyModel, _scope: &Scope| Ok(())),
        build_forward: Box::new(|model, scope| {
            let name = match scope.device {
                DeviceAffinity::Accelerator(0) => "w",
                _ => "w_diverged",
            };
            model.add_param(scope, name);
            let loss = model.add_compute(scope, "Loss", &[], "loss");
            Ok(vec![loss])
        }),
        build_update: Some(Box::new(|_model, _scope, _lr_scale| Ok(()))),
    };
    let err = parallelize(&mut model, hooks, options(vec![0, 1])).unwrap_err();
    assert!(err.downcast_ref::<lockstep_replicate::GroupingError>().is_some());
}
