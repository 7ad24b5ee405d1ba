//! Typed id aliases for AsyncGate's core entities.
//!
//! Each marker type below exists only to make `Id<T, V>` distinct per entity kind,
//! following the pattern in `common::id`.

use super::id::{Id, V4};

pub struct Tenant;
pub struct Task;
pub struct Lease;
pub struct Receipt;

/// Tenant ids are caller-supplied (they come from whatever provisions tenants
/// upstream of AsyncGate), so they use V4 rather than the time-ordered V7 default.
pub type TenantId = Id<Tenant, V4>;

pub type TaskId = Id<Task>;
pub type LeaseId = Id<Lease>;
pub type ReceiptId = Id<Receipt>;
