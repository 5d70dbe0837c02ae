use serde::{Deserialize, Serialize};
use strata_common::VolumeId;

/// A disk volume of a writer node, registered while the node is alive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub volume_id: VolumeId,
    pub node_id: String,
    pub path: String,
}
