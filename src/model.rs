use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only timestamp type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// One hour of one calendar day in the engine's fixed UTC offset.
///
/// Ordered by date, then hour. Never mutated once attached to a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeSlot {
    date: NaiveDate,
    hour: u8,
}

impl TimeSlot {
    /// Returns `None` when `hour` is outside `0..=23`.
    pub fn new(date: NaiveDate, hour: u8) -> Option<Self> {
        (hour < 24).then_some(Self { date, hour })
    }

    /// For hours that are in range by construction (e.g. `Timelike::hour`).
    pub(crate) fn clamped(date: NaiveDate, hour: u32) -> Self {
        Self {
            date,
            hour: hour.min(23) as u8,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    /// The next hour, rolling over to hour 0 of the next date after 23.
    pub fn successor(&self) -> Self {
        if self.hour == 23 {
            Self {
                date: self.date.succ_opt().unwrap_or(NaiveDate::MAX),
                hour: 0,
            }
        } else {
            Self {
                date: self.date,
                hour: self.hour + 1,
            }
        }
    }

    /// Parse the wire form: a `YYYY-MM-DD` date plus an hour.
    pub fn parse(date: &str, hour: i64) -> Option<Self> {
        let date = date.parse::<NaiveDate>().ok()?;
        let hour = u8::try_from(hour).ok()?;
        Self::new(date, hour)
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:02}:00", self.date, self.hour)
    }
}

/// Holder identities compare case-insensitively.
pub fn same_holder(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// Exclusive reservation of one resource for one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_id: String,
    pub slot: TimeSlot,
    pub holder: String,
    pub acquired_at: Ms,
    /// End of `slot` in the fixed offset.
    pub expires_at: Ms,
}

impl Lease {
    pub fn is_live(&self, now: Ms) -> bool {
        now < self.expires_at
    }

    pub fn held_by(&self, holder: &str) -> bool {
        same_holder(&self.holder, holder)
    }
}

/// Caller role, supplied by the auth collaborator on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Operator,
    Admin,
    /// Inspects without acquiring; exempt from lease ownership checks.
    SuperAdmin,
}

impl Role {
    pub fn is_inspection_exempt(self) -> bool {
        matches!(self, Role::SuperAdmin)
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }

    /// Whether a login granted `self` may run a statement as `requested`.
    pub fn covers(self, requested: Role) -> bool {
        requested.rank() <= self.rank()
    }

    fn rank(self) -> u8 {
        match self {
            Role::Operator => 0,
            Role::Admin => 1,
            Role::SuperAdmin => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "operator" | "user" => Some(Role::Operator),
            "admin" => Some(Role::Admin),
            "super_admin" | "superadmin" => Some(Role::SuperAdmin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Operator => "operator",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReleaseReason {
    Manual,
    /// Resource marked fully processed for the slot.
    Completed,
    Expired,
    Administrative,
    /// Resource no longer resolves in the directory.
    Stale,
}

impl ReleaseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseReason::Manual => "manual",
            ReleaseReason::Completed => "completed",
            ReleaseReason::Expired => "expired",
            ReleaseReason::Administrative => "administrative",
            ReleaseReason::Stale => "stale",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Some(ReleaseReason::Manual),
            "completed" => Some(ReleaseReason::Completed),
            "expired" => Some(ReleaseReason::Expired),
            "administrative" | "admin" => Some(ReleaseReason::Administrative),
            "stale" => Some(ReleaseReason::Stale),
            _ => None,
        }
    }

    /// Whether the former holder may still auto-save into the slot.
    pub fn permits_autosave(self) -> bool {
        matches!(
            self,
            ReleaseReason::Manual | ReleaseReason::Completed | ReleaseReason::Expired
        )
    }
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const NO_ISSUE: &str = "No issue";
pub const AUTOSAVE_MARKER: &str = "(Auto-saved)";

/// What an operator records for one resource in one hour.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Observation {
    pub issue_present: bool,
    pub description: String,
    pub case_number: Option<String>,
    pub missed_by: Option<String>,
}

impl Observation {
    pub fn no_issue() -> Self {
        Self {
            issue_present: false,
            description: NO_ISSUE.to_string(),
            case_number: None,
            missed_by: None,
        }
    }

    pub fn issue(description: impl Into<String>) -> Self {
        Self {
            issue_present: true,
            description: description.into(),
            case_number: None,
            missed_by: None,
        }
    }

    /// A draft is worth auto-saving only once the operator typed something.
    pub fn is_blank(&self) -> bool {
        !self.issue_present
            && self.description.trim().is_empty()
            && self.case_number.as_deref().is_none_or(|c| c.trim().is_empty())
            && self.missed_by.as_deref().is_none_or(|m| m.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    Operator,
    /// Unsubmitted draft persisted on a context switch.
    AutoSave,
}

/// Immutable observation log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: Ulid,
    pub resource_id: String,
    pub slot: TimeSlot,
    pub holder: String,
    pub observation: Observation,
    pub auto_saved: bool,
    pub created_at: Ms,
}

/// Per-resource "fully processed" marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub slot: TimeSlot,
    pub holder: String,
    pub completed_at: Ms,
}

impl Completion {
    pub fn covers_date(&self, date: NaiveDate) -> bool {
        self.slot.date() == date
    }
}

/// Tombstone of the most recent lease that ended on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndedLease {
    pub holder: String,
    pub ended_at: Ms,
    pub reason: ReleaseReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: String,
    pub name: Option<String>,
}

/// Everything the engine tracks for one resource id.
///
/// A lane exists for any resource id a lease or entry names, registered or
/// not; stale leases live in lanes whose id has left the registry.
#[derive(Debug, Clone)]
pub struct LaneState {
    pub resource_id: String,
    /// At most one lease per slot; expired rows linger until swept.
    pub leases: BTreeMap<TimeSlot, Lease>,
    pub ended: BTreeMap<TimeSlot, EndedLease>,
    pub entries: Vec<Entry>,
    pub completion: Option<Completion>,
}

impl LaneState {
    pub fn new(resource_id: String) -> Self {
        Self {
            resource_id,
            leases: BTreeMap::new(),
            ended: BTreeMap::new(),
            entries: Vec::new(),
            completion: None,
        }
    }

    pub fn live_lease(&self, slot: &TimeSlot, now: Ms) -> Option<&Lease> {
        self.leases.get(slot).filter(|l| l.is_live(now))
    }

    pub fn insert_lease(&mut self, lease: Lease) {
        self.ended.remove(&lease.slot);
        self.leases.insert(lease.slot, lease);
    }

    /// Remove the lease on `slot`, leaving a tombstone behind.
    pub fn remove_lease(&mut self, slot: &TimeSlot, reason: ReleaseReason, at: Ms) -> Option<Lease> {
        let lease = self.leases.remove(slot)?;
        self.ended.insert(
            *slot,
            EndedLease {
                holder: lease.holder.clone(),
                ended_at: at,
                reason,
            },
        );
        // Tombstones only matter for a short grace window.
        self.ended.retain(|_, e| at - e.ended_at < 24 * HOUR_MS);
        Some(lease)
    }

    pub fn expired_slots(&self, now: Ms) -> Vec<TimeSlot> {
        self.leases
            .values()
            .filter(|l| !l.is_live(now))
            .map(|l| l.slot)
            .collect()
    }

    pub fn entries_for(&self, slot: Option<&TimeSlot>) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(move |e| slot.is_none_or(|s| e.slot == *s))
    }
}

/// The event types: flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: String,
        name: Option<String>,
    },
    ResourceUnregistered {
        id: String,
    },
    LeaseAcquired {
        lease: Lease,
    },
    LeaseReleased {
        resource_id: String,
        slot: TimeSlot,
        holder: String,
        reason: ReleaseReason,
        at: Ms,
    },
    EntryAppended {
        entry: Entry,
    },
    CompletionMarked {
        resource_id: String,
        completion: Completion,
    },
    CompletionCleared {
        resource_id: String,
    },
}

impl Event {
    pub fn resource_id(&self) -> &str {
        match self {
            Event::ResourceRegistered { id, .. } | Event::ResourceUnregistered { id } => id,
            Event::LeaseAcquired { lease } => &lease.resource_id,
            Event::EntryAppended { entry } => &entry.resource_id,
            Event::LeaseReleased { resource_id, .. }
            | Event::CompletionMarked { resource_id, .. }
            | Event::CompletionCleared { resource_id } => resource_id,
        }
    }
}
