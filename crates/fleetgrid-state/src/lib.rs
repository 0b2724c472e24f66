//! fleetgrid-state — embedded state store for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for targets, distribution sets, rollouts, rollout groups,
//! group members, and update actions.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{rollout_id}:{ordinal}`, `{rollout_id}:{ordinal}:{controller_id}`)
//! enable efficient prefix scans for related records, so per-group action
//! statistics come from a single table pass instead of one lookup per target.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod clock;
pub mod error;
pub mod filter;
pub mod store;
pub mod tables;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StateError, StateResult};
pub use filter::TargetFilter;
pub use store::StateStore;
pub use types::*;
