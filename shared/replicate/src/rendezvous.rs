use std::collections::HashMap;

use lockstep_core::{BlobRef, CanonicalKey, Net, OpKind, OperatorDef, Scope, TransportEngine};
use serde::{Deserialize, Serialize};

/// This host's place in a distributed run, supplied once per training session.
/// Absent from the options means single-host training.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// Handle to the key-value store used to form communication groups.
    pub kv_handler: BlobRef,
    pub shard_count: usize,
    pub shard_id: usize,
    pub engine: TransportEngine,
}

/// Identifies the synchronized quantity a common world belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum WorldKey {
    Gradient(CanonicalKey),
    Param(CanonicalKey),
    IterationCounter,
}

impl WorldKey {
    /// Deterministic group name. Hosts never negotiate names out-of-band, so
    /// every host must derive the same name for the same quantity.
    pub fn world_name(&self) -> String {
        match self {
            WorldKey::Gradient(key) | WorldKey::Param(key) => format!("{key}_cw"),
            WorldKey::IterationCounter => "iter_cw".to_owned(),
        }
    }
}

/// Memoizing factory for common worlds: one world per key per process, never
/// destroyed, reused for the life of the training graph.
///
/// Worlds must be formed in the same relative order on every host. There is no
/// cross-host handshake to catch divergence; callers iterate quantities in a
/// deterministic order (parameters sorted, gradients in reduction order).
#[derive(Debug, Default)]
pub struct WorldRegistry {
    worlds: HashMap<WorldKey, BlobRef>,
}

impl WorldRegistry {
    /// Returns the world handle for `key`, inserting its formation op into
    /// `init_net` under `scope` on first request.
    pub fn get_or_create(
        &mut self,
        key: WorldKey,
        init_net: &mut Net,
        scope: &Scope,
        config: &RendezvousConfig,
    ) -> BlobRef {
        if let Some(world) = self.worlds.get(&key) {
            return world.clone();
        }

        let name = key.world_name();
        let world = BlobRef::new(name.clone());
        init_net.push(OperatorDef {
            kind: OpKind::CreateCommonWorld {
                world: name,
                size: config.shard_count,
                rank: config.shard_id,
                engine: config.engine,
            },
            inputs: vec![config.kv_handler.clone()],
            outputs: vec![world.clone()],
            device: scope.device,
            control_inputs: Vec::new(),
        });
        self.worlds.insert(key, world.clone());
        world
    }

    pub fn len(&self) -> usize {
        self.worlds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.worlds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RendezvousConfig {
        RendezvousConfig {
            kv_handler: BlobRef::from("kv_handler"),
            shard_count: 3,
            shard_id: 1,
            engine: TransportEngine::Device,
        }
    }

    #[test]
    fn test_world_names_are_deterministic() {
        assert_eq!(
            WorldKey::Gradient(CanonicalKey::from("w_grad")).world_name(),
            "w_grad_cw"
        );
        assert_eq!(
            WorldKey::Param(CanonicalKey::from("w")).world_name(),
            "w_cw"
        );
        assert_eq!(WorldKey::IterationCounter.world_name(), "iter_cw");
    }

    #[test]
    fn test_worlds_are_memoized() {
        let mut registry = WorldRegistry::default();
        let mut init_net = Net::new("init");
        let scope = Scope::host();
        let config = config();

        let key = WorldKey::Gradient(CanonicalKey::from("w_grad"));
        let first = registry.get_or_create(key.clone(), &mut init_net, &scope, &config);
        let second = registry.get_or_create(key, &mut init_net, &scope, &config);

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(init_net.ops().len(), 1);
        match &init_net.ops()[0].kind {
            OpKind::CreateCommonWorld {
                world, size, rank, ..
            } => {
                assert_eq!(world, "w_grad_cw");
                assert_eq!(*size, 3);
                assert_eq!(*rank, 1);
            }
            other => panic!("expected CreateCommonWorld, got {other:?}"),
        }
        assert_eq!(init_net.ops()[0].inputs[0].as_str(), "kv_handler");
    }
}
