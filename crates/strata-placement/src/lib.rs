//! Strata Placement - ownership distribution
//!
//! Nodes join named groups in the metadata store. Every key is owned by
//! exactly one live member of a group, chosen by HRW (rendezvous) hashing,
//! so membership changes only move the keys of the joining or leaving node.
//!
//! # Example
//! ```ignore
//! use strata_placement::DistributionNode;
//!
//! let node = DistributionNode::new(store, "node-1", &config.distribution, cancel);
//! let group = node.group("operator.file.rotation").await?;
//! if group.must_check_is_owner(&file_key.to_string()) {
//!     // process the file
//! }
//! ```

pub mod distribution;
pub mod hrw;

pub use distribution::{ChangeEvent, DistributionError, DistributionNode, GroupNode};
pub use hrw::{hrw_score, hrw_select, hrw_select_n};
