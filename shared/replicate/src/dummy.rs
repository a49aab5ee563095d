use std::collections::{HashMap, HashSet};

use anyhow::Result;
use lockstep_core::{BlobRef, ModelGraph, Net, NetExecutor, OpKind, OperatorDef, Scope};

/// Minimal model-graph implementation for tests and examples: tracks replica
/// blobs and emits one placeholder gradient operator per parameter.
#[derive(Debug)]
pub struct DummyModel {
    net: Net,
    init_net: Net,
    params: Vec<BlobRef>,
    computed_params: Vec<BlobRef>,
    frozen: HashSet<BlobRef>,
}

impl Default for DummyModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyModel {
    pub fn new() -> Self {
        Self {
            net: Net::new("train"),
            init_net: Net::new("init"),
            params: Vec::new(),
            computed_params: Vec::new(),
            frozen: HashSet::new(),
        }
    }

    /// Registers a parameter with a constant-fill initializer in the init net.
    pub fn add_param(&mut self, scope: &Scope, name: &str) -> BlobRef {
        let blob = scope.blob(name);
        self.init_net
            .constant_fill(scope, None, blob.clone(), 0.0, Some(vec![1]));
        self.params.push(blob.clone());
        blob
    }

    /// Registers a computed (non-trainable) quantity.
    pub fn add_computed_param(&mut self, scope: &Scope, name: &str) -> BlobRef {
        let blob = scope.blob(name);
        self.init_net
            .constant_fill(scope, None, blob.clone(), 0.0, Some(vec![1]));
        self.computed_params.push(blob.clone());
        blob
    }

    /// Excludes a parameter from gradient emission.
    pub fn freeze(&mut self, blob: &BlobRef) {
        self.frozen.insert(blob.clone());
    }

    /// Adds a placeholder computation reading `inputs` and producing `output`.
    pub fn add_compute(
        &mut self,
        scope: &Scope,
        op: &str,
        inputs: &[BlobRef],
        output: &str,
    ) -> BlobRef {
        let out = scope.blob(output);
        self.net.push(OperatorDef {
            kind: OpKind::Compute(op.to_owned()),
            inputs: inputs.to_vec(),
            outputs: vec![out.clone()],
            device: scope.device,
            control_inputs: Vec::new(),
        });
        out
    }
}

impl ModelGraph for DummyModel {
    fn net(&self) -> &Net {
        &self.net
    }

    fn net_mut(&mut self) -> &mut Net {
        &mut self.net
    }

    fn init_net(&self) -> &Net {
        &self.init_net
    }

    fn init_net_mut(&mut self) -> &mut Net {
        &mut self.init_net
    }

    fn params(&self) -> Vec<BlobRef> {
        self.params.clone()
    }

    fn computed_params(&self) -> Vec<BlobRef> {
        self.computed_params.clone()
    }

    fn emit_gradient_ops(
        &mut self,
        loss_seeds: &HashMap<BlobRef, BlobRef>,
    ) -> Result<HashMap<BlobRef, BlobRef>> {
        let mut param_to_grad = HashMap::new();
        for param in self.params.clone() {
            if self.frozen.contains(&param) {
                continue;
            }
            let device = param.device_ordinal();
            let seed = loss_seeds
                .iter()
                .find(|(loss, _)| loss.device_ordinal() == device)
                .map(|(_, seed)| seed.clone());

            let grad = param.with_suffix("_grad");
            let mut inputs = vec![param.clone()];
            inputs.extend(seed);
            let scope = match device {
                Some(device) => Scope::replica(device),
                None => Scope::host(),
            };
            self.net.push(OperatorDef {
                kind: OpKind::Compute("ComputeGradient".into()),
                inputs,
                outputs: vec![grad.clone()],
                device: scope.device,
                control_inputs: Vec::new(),
            });
            param_to_grad.insert(param, grad);
        }
        Ok(param_to_grad)
    }
}

/// Records executor interactions instead of running anything.
#[derive(Debug, Default)]
pub struct DummyExecutor {
    pub ran_once: Vec<Net>,
    pub created: Vec<Net>,
    pub runs: Vec<String>,
}

impl NetExecutor for DummyExecutor {
    fn run_once(&mut self, net: &Net) -> Result<()> {
        self.ran_once.push(net.clone());
        Ok(())
    }

    fn create_persistent(&mut self, net: &Net) -> Result<()> {
        self.created.push(net.clone());
        Ok(())
    }

    fn run(&mut self, net_name: &str) -> Result<()> {
        self.runs.push(net_name.to_owned());
        Ok(())
    }
}
