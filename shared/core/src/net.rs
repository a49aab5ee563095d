use serde::{Deserialize, Serialize};

use crate::blob::BlobRef;
use crate::device::{DeviceAffinity, Scope};

/// How the cross-host collective backend addresses its buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportEngine {
    /// Collectives run directly on device-resident buffers.
    Device,
    /// The transport only addresses host memory; reductions stage through a
    /// host-side scratch blob.
    HostStaged,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Fill the output with a constant. With an input, the output takes the
    /// input's shape; otherwise `shape` must be given.
    ConstantFill { value: f64, shape: Option<Vec<i64>> },
    Copy,
    CopyToHost,
    CopyFromHost,
    /// In-place all-reduce across one host's replica devices.
    DeviceAllReduce,
    /// Form a named cross-host communication group via the key-value
    /// rendezvous handler given as input.
    CreateCommonWorld {
        world: String,
        size: usize,
        rank: usize,
        engine: TransportEngine,
    },
    WorldAllReduce { engine: TransportEngine },
    WorldBroadcast { engine: TransportEngine },
    /// Caller-defined computation.
    Compute(String),
}

impl OpKind {
    pub fn is_collective(&self) -> bool {
        matches!(
            self,
            OpKind::DeviceAllReduce
                | OpKind::CreateCommonWorld { .. }
                | OpKind::WorldAllReduce { .. }
                | OpKind::WorldBroadcast { .. }
        )
    }

    pub fn is_copy(&self) -> bool {
        matches!(self, OpKind::Copy | OpKind::CopyToHost | OpKind::CopyFromHost)
    }

    pub fn name(&self) -> &str {
        match self {
            OpKind::ConstantFill { .. } => "ConstantFill",
            OpKind::Copy => "Copy",
            OpKind::CopyToHost => "CopyToHost",
            OpKind::CopyFromHost => "CopyFromHost",
            OpKind::DeviceAllReduce => "DeviceAllReduce",
            OpKind::CreateCommonWorld { .. } => "CreateCommonWorld",
            OpKind::WorldAllReduce { .. } => "WorldAllReduce",
            OpKind::WorldBroadcast { .. } => "WorldBroadcast",
            OpKind::Compute(name) => name,
        }
    }
}

/// One operator in a net.
///
/// `control_inputs` are must-come-after edges for the executor, not data
/// inputs: an operator only becomes runnable once the operators producing its
/// control inputs have finished.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatorDef {
    pub kind: OpKind,
    pub inputs: Vec<BlobRef>,
    pub outputs: Vec<BlobRef>,
    pub device: DeviceAffinity,
    pub control_inputs: Vec<BlobRef>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetKind {
    /// Parallel DAG execution on a worker pool.
    #[default]
    Dag,
    /// Sequential execution in insertion order.
    Simple,
}

/// A static operator graph, executed later by the external executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Net {
    pub name: String,
    pub kind: NetKind,
    pub num_workers: usize,
    /// Run the first iteration with a single worker: first-touch allocation
    /// and communicator setup are unsafe to race.
    pub first_iter_single_worker: bool,
    ops: Vec<OperatorDef>,
}

impl Net {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NetKind::default(),
            num_workers: 1,
            first_iter_single_worker: false,
            ops: Vec::new(),
        }
    }

    pub fn ops(&self) -> &[OperatorDef] {
        &self.ops
    }

    pub fn push(&mut self, op: OperatorDef) {
        self.ops.push(op);
    }

    pub fn constant_fill(
        &mut self,
        scope: &Scope,
        input: Option<&BlobRef>,
        output: BlobRef,
        value: f64,
        shape: Option<Vec<i64>>,
    ) -> BlobRef {
        self.push(OperatorDef {
            kind: OpKind::ConstantFill { value, shape },
            inputs: input.cloned().into_iter().collect(),
            outputs: vec![output.clone()],
            device: scope.device,
            control_inputs: Vec::new(),
        });
        output
    }

    pub fn copy(&mut self, scope: &Scope, from: &BlobRef, to: &BlobRef) {
        self.push_copy(OpKind::Copy, scope, from, to);
    }

    pub fn copy_to_host(&mut self, scope: &Scope, from: &BlobRef, to: &BlobRef) {
        self.push_copy(OpKind::CopyToHost, scope, from, to);
    }

    pub fn copy_from_host(&mut self, scope: &Scope, from: &BlobRef, to: &BlobRef) {
        self.push_copy(OpKind::CopyFromHost, scope, from, to);
    }

    fn push_copy(&mut self, kind: OpKind, scope: &Scope, from: &BlobRef, to: &BlobRef) {
        self.push(OperatorDef {
            kind,
            inputs: vec![from.clone()],
            outputs: vec![to.clone()],
            device: scope.device,
            control_inputs: Vec::new(),
        });
    }
}
