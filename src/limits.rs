use crate::model::Ms;

// ── Identity / text lengths ──────────────────────────────────────

pub const MAX_RESOURCE_ID_LEN: usize = 128;
pub const MAX_RESOURCE_NAME_LEN: usize = 256;
pub const MAX_HOLDER_LEN: usize = 320;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_CASE_NUMBER_LEN: usize = 64;

// ── Per-tenant capacity ──────────────────────────────────────────

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_ENTRIES_PER_RESOURCE: usize = 1_000_000;

// ── Tenants ──────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

// ── Time ─────────────────────────────────────────────────────────

/// Window after a lease ends during which its former holder may still
/// persist an auto-saved draft for that slot.
pub const DEFAULT_AUTOSAVE_GRACE_MS: Ms = 10 * 60 * 1000;
