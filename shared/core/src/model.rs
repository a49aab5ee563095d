use std::collections::HashMap;

use anyhow::Result;

use crate::blob::BlobRef;
use crate::net::Net;

/// The caller's model under construction: the training and initialization
/// nets, plus the ordered lists of replica blobs created so far.
///
/// `params` must return all replicas in creation order, so that one device's
/// parameters form one contiguous block; device grouping depends on that
/// layout. Gradient computation itself stays on the other side of this seam,
/// only emission of the gradient operators is requested through it.
pub trait ModelGraph {
    fn net(&self) -> &Net;
    fn net_mut(&mut self) -> &mut Net;
    fn init_net(&self) -> &Net;
    fn init_net_mut(&mut self) -> &mut Net;

    /// All replica parameter blobs, in creation order.
    fn params(&self) -> Vec<BlobRef>;

    /// Non-trainable computed quantities (e.g. normalization statistics), in
    /// creation order.
    fn computed_params(&self) -> Vec<BlobRef>;

    /// Emits gradient operators for the given loss -> seed map and returns the
    /// per-replica parameter -> gradient mapping.
    fn emit_gradient_ops(
        &mut self,
        loss_seeds: &HashMap<BlobRef, BlobRef>,
    ) -> Result<HashMap<BlobRef, BlobRef>>;
}
