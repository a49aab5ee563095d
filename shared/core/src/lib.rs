mod blob;
mod device;
mod model;
mod net;
mod runtime;

pub use blob::{device_namespace, BlobRef, CanonicalKey, NAMESPACE_SEPARATOR};
pub use device::{DeviceAffinity, DeviceList, DeviceListParseError, Scope};
pub use model::ModelGraph;
pub use net::{Net, NetKind, OpKind, OperatorDef, TransportEngine};
pub use runtime::{MemoryOptimizer, NetExecutor};
