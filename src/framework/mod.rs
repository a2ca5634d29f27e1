//! Generic secrets-engine plumbing: path routing, field coercion, leases,
//! secret types and write-ahead logged rollback.
//!
//! A concrete engine declares a [`Backend`] made of [`Path`]s and
//! [`Secret`]s; the broker hands it [`Request`]s.

pub mod backend;
pub mod duration;
pub mod field;
pub mod lease;
pub mod path;
pub mod request;
pub mod response;
pub mod secret;
pub mod system;
pub mod wal;

pub use backend::{Backend, PeriodicFunc, WalRollbackFunc};
pub use field::{FieldData, FieldSchema, FieldType, FieldValue};
pub use path::{Path, PathOperation};
pub use request::{Operation, Request};
pub use response::{Response, SecretLease};
pub use secret::Secret;
pub use system::{ReplicationState, StaticSystemView, SystemView};
