mod broadcast;
mod checkpoint;
mod driver;
mod dummy;
mod gradients;
mod grouping;
mod rendezvous;
mod replica;
mod sync;
mod validate;

pub use broadcast::broadcast;
pub use checkpoint::CHECKPOINT_SYNC_NET;
pub use driver::{parallelize, ConfigurationError, ParallelizeOptions, ReplicationHooks};
pub use dummy::{DummyExecutor, DummyModel};
pub use grouping::{DeviceGroupedStore, GroupingError};
pub use rendezvous::{RendezvousConfig, WorldKey, WorldRegistry};
pub use replica::{ReplicaSet, ITERATION_COUNTER};
pub use validate::{validate_device_scopes, ScopeViolation};
