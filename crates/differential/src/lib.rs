//! # Differential - versioned records and the write buffer
//!
//! Every write lands in a [`DifferentialComponent`] as a [`VersionedRecord`].
//! A component keeps at most two versions per key (current and previous);
//! when a third arrives, the oldest one is handed back to the caller as a
//! [`RetiredPair`] so it can be routed through version retirement.
//!
//! ```text
//!   add(k, v3)          current  previous       returned
//!   ------------------  -------  --------       --------------------
//!   k empty             v3       -              None
//!   k = [v2]            v3       v2             None
//!   k = [v2, v1]        v3       v2             Some(v1 retired by v2)
//! ```
//!
//! At checkpoint rotation the component is frozen with [`DifferentialComponent::sort`]
//! and becomes a read-only delta in the aggregated chain.
//!
//! Key ordering is injected at construction through [`KeyComparer`].

mod comparer;
mod component;
mod record;

pub use comparer::{bytewise, BytewiseComparer, KeyComparer, SharedComparer};
pub use component::{DifferentialComponent, DifferentialVersions, RetiredPair};
pub use record::{RecordKind, ValueLocation, VersionedRecord};

#[cfg(test)]
mod tests;
