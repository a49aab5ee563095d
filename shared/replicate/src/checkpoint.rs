use anyhow::Result;
use lockstep_core::{BlobRef, CanonicalKey, Net, NetExecutor, Scope};
use tracing::{debug, info};

use crate::broadcast::sync_params;
use crate::replica::ReplicaSet;
use crate::sync::{add_distributed_param_sync, SyncNets};

pub const CHECKPOINT_SYNC_NET: &str = "checkpoint_sync_net";
const CHECKPOINT_INIT_NET: &str = "checkpoint_init_net";

impl ReplicaSet {
    /// Brings every device (and every shard, when distributed) to the same
    /// state for `blobs` after a checkpoint load or before a save.
    ///
    /// The synchronization net is built once, on the first call, and executed
    /// on every call. `blobs` may name quantities that were never grouped at
    /// build time, such as optimizer momentum buffers; those are registered
    /// with synthesized per-device handles.
    pub fn finalize_after_checkpoint<E: NetExecutor>(
        &mut self,
        blobs: &[BlobRef],
        sync_iteration: bool,
        executor: &mut E,
    ) -> Result<()> {
        if self.checkpoint_net.is_none() {
            info!("creating checkpoint synchronization net");
            // replicas of one quantity strip to the same canonical key
            let mut keys: Vec<CanonicalKey> = Vec::new();
            for blob in blobs {
                let key = blob.canonical_key();
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            for key in &keys {
                if !self.grouped.contains_key(key) {
                    self.grouped.register_synthesized(key.clone(), &self.devices);
                }
            }

            let mut net = Net::new(CHECKPOINT_SYNC_NET);
            if let Some(config) = self.rendezvous.clone() {
                let mut init_net = Net::new(CHECKPOINT_INIT_NET);
                add_distributed_param_sync(
                    SyncNets::Split {
                        init: &mut init_net,
                        run: &mut net,
                    },
                    self,
                    &config,
                    &keys,
                )?;
                executor.run_once(&init_net)?;
            }

            sync_params(&mut net, &self.devices, &self.grouped, &keys)?;

            if sync_iteration {
                // the counter lives in host memory, so it is copied host-side
                let host = Scope::host();
                let master_iter = self.iteration_counter(self.devices.master());
                for &device in &self.devices[1..] {
                    net.copy(&host, &master_iter, &self.iteration_counter(device));
                }
            }

            executor.create_persistent(&net)?;
            self.checkpoint_net = Some(net);
        }

        debug!("running checkpoint sync net");
        executor.run(CHECKPOINT_SYNC_NET)
    }
}
