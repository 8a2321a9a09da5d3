//! Set-valued field mutations.
//!
//! Every set-like field (memberships, likes, bookmarks, reaction maps) is
//! declared once in a [`FieldSchema`] as either `atomic` (the store applies
//! union/remove natively) or `composite` (a key → set map that needs a
//! version-guarded read-modify-write). The [`MutationCoordinator`] picks the
//! strategy from the declaration, so features never carry their own
//! mutation code.

mod coordinator;
mod keyed_lock;
mod schema;
mod set_field;

pub use coordinator::{CreateAndIncrement, MutationCoordinator, MutationOp, MutationOutcome, MutationRequest};
pub use keyed_lock::{KeyGuard, KeyedLocks};
pub use schema::FieldSchema;
pub use set_field::{edit_map, members, FieldKind, MapEdit, SetField};
