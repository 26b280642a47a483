//! Three-state authority flag for a client session and the pure reducer
//! that moves it in response to server replies.

use crate::coordinator::{Grant, ReadOnlyReason};
use crate::model::{Lease, TimeSlot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authority {
    /// Shown as editable while the acquisition is in flight.
    Pending,
    Confirmed,
    Rejected(ReadOnly),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOnly {
    Inspection,
    LockedBy(String),
    HolderBusy { resource_id: String, slot: TimeSlot },
    /// Our lease disappeared (released, expired or force-released).
    Lost,
    /// Someone else's lease went away; reopen to edit.
    Vacant,
    /// Acquisition outcome unknown after a transport failure.
    Unconfirmed,
}

impl Authority {
    /// Whether the UI may accept edits.
    pub fn is_authoritative(&self) -> bool {
        matches!(self, Authority::Pending | Authority::Confirmed)
    }
}

/// A server reply, or the lack of one, as seen by the reducer.
#[derive(Debug, Clone, Copy)]
pub enum Signal<'a> {
    Granted(&'a Grant),
    /// The call failed in transport; `previous` is what was shown before it.
    Failed { previous: Option<&'a Authority> },
    /// Current lease on the session's key, if any.
    Polled(Option<&'a Lease>),
    /// An entry or completion was refused; `holder` owns the key, if anyone.
    Denied(Option<&'a str>),
}

pub fn reduce(current: &Authority, signal: Signal<'_>, holder: &str) -> Authority {
    match signal {
        Signal::Granted(Grant::Editing(_)) => Authority::Confirmed,
        Signal::Granted(Grant::ReadOnly(reason)) => Authority::Rejected(match reason {
            ReadOnlyReason::Inspection => ReadOnly::Inspection,
            ReadOnlyReason::LockedBy(other) => ReadOnly::LockedBy(other.clone()),
            ReadOnlyReason::HolderBusy { resource_id, slot } => ReadOnly::HolderBusy {
                resource_id: resource_id.clone(),
                slot: *slot,
            },
        }),
        Signal::Failed { previous } => previous
            .cloned()
            .unwrap_or(Authority::Rejected(ReadOnly::Unconfirmed)),
        Signal::Polled(_) if *current == Authority::Rejected(ReadOnly::Inspection) => current.clone(),
        Signal::Polled(Some(lease)) if lease.held_by(holder) => Authority::Confirmed,
        Signal::Polled(Some(lease)) => Authority::Rejected(ReadOnly::LockedBy(lease.holder.clone())),
        Signal::Polled(None) => match current {
            Authority::Pending | Authority::Confirmed => Authority::Rejected(ReadOnly::Lost),
            Authority::Rejected(ReadOnly::LockedBy(_)) => Authority::Rejected(ReadOnly::Vacant),
            other => other.clone(),
        },
        Signal::Denied(_) if *current == Authority::Rejected(ReadOnly::Inspection) => current.clone(),
        Signal::Denied(Some(other)) => Authority::Rejected(ReadOnly::LockedBy(other.to_string())),
        Signal::Denied(None) => Authority::Rejected(ReadOnly::Lost),
    }
}
