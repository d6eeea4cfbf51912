//! Slot identity and weak, staleness-checked references
//!
//! A [`SlotLink`] never owns its slot. Validity is decided by comparing the
//! captured id with the slot's live `(id, step)` pair, read with a single
//! atomic load, so a slot that was recycled for another task reads as stale.

use crate::smachine::slot::Slot;
use std::fmt;
use std::sync::{Arc, Weak};

/// Opaque slot identifier assigned by the Machine
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SlotId(u32);

impl SlotId {
    /// Reserved "unknown/invalid" id
    pub const UNKNOWN: SlotId = SlotId(0);

    /// Create a SlotId from its raw value
    pub const fn from_u32(id: u32) -> Self {
        SlotId(id)
    }

    /// Get the raw id value
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// True for the reserved zero id
    pub const fn is_unknown(self) -> bool {
        self.0 == Self::UNKNOWN.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Weak reference to a slot instance
#[derive(Clone, Default)]
pub struct SlotLink {
    id: SlotId,
    slot: Option<Weak<Slot>>,
}

impl SlotLink {
    /// A link attached to nothing
    pub const fn none() -> Self {
        SlotLink {
            id: SlotId::UNKNOWN,
            slot: None,
        }
    }

    pub(crate) fn new(id: SlotId, slot: &Arc<Slot>) -> Self {
        SlotLink {
            id,
            slot: Some(Arc::downgrade(slot)),
        }
    }

    /// Id captured when the link was made
    pub fn slot_id(&self) -> SlotId {
        self.id
    }

    /// True when no slot is attached
    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    /// True while the attached slot still runs the captured instance
    pub fn is_valid(&self) -> bool {
        match self.live_pair() {
            Some((id, _)) => id == self.id,
            None => false,
        }
    }

    /// Resolve the attached slot, whether or not it is still valid
    pub(crate) fn slot(&self) -> Option<Arc<Slot>> {
        self.slot.as_ref().and_then(Weak::upgrade)
    }

    fn live_pair(&self) -> Option<(SlotId, u32)> {
        self.slot().map(|slot| slot.id_and_step())
    }
}

impl PartialEq for SlotLink {
    fn eq(&self, other: &Self) -> bool {
        let same_slot = match (&self.slot, &other.slot) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => true,
            _ => false,
        };
        same_slot && self.id == other.id
    }
}

impl fmt::Debug for SlotLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("SlotLink(none)");
        }
        write!(f, "SlotLink({})", self.id)
    }
}

/// Which steps of a slot instance a [`StepLink`] accepts
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepMatch {
    /// Any step of the captured instance
    Any,
    /// Only this step generation
    Exact(u32),
}

/// A [`SlotLink`] scoped to one step generation, or to any step
#[derive(Clone, Default, PartialEq)]
pub struct StepLink {
    link: SlotLink,
    step: Option<StepMatch>,
}

impl StepLink {
    /// A step link attached to nothing
    pub const fn none() -> Self {
        StepLink {
            link: SlotLink::none(),
            step: None,
        }
    }

    /// Accept only the given step generation
    pub fn exact(link: SlotLink, step: u32) -> Self {
        StepLink {
            link,
            step: Some(StepMatch::Exact(step)),
        }
    }

    /// Accept any step of the linked instance
    pub fn any(link: SlotLink) -> Self {
        StepLink {
            link,
            step: Some(StepMatch::Any),
        }
    }

    /// The underlying slot link
    pub fn slot_link(&self) -> &SlotLink {
        &self.link
    }

    /// Step selector, `None` for an empty link
    pub fn step(&self) -> Option<StepMatch> {
        self.step
    }

    /// Id captured when the link was made
    pub fn slot_id(&self) -> SlotId {
        self.link.slot_id()
    }

    /// True when no slot is attached
    pub fn is_empty(&self) -> bool {
        self.link.is_empty()
    }

    /// True while the attached slot still runs the captured instance
    pub fn is_valid(&self) -> bool {
        self.link.is_valid()
    }

    /// True while the link is valid and the slot is at an accepted step
    pub fn is_at_step(&self) -> bool {
        let (id, step) = match self.link.live_pair() {
            Some(pair) => pair,
            None => return false,
        };
        if id != self.link.id {
            return false;
        }
        match self.step {
            Some(StepMatch::Any) => true,
            Some(StepMatch::Exact(expected)) => expected == step,
            None => false,
        }
    }

    pub(crate) fn slot(&self) -> Option<Arc<Slot>> {
        self.link.slot()
    }
}

impl fmt::Debug for StepLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            None => f.write_str("StepLink(none)"),
            Some(StepMatch::Any) => write!(f, "StepLink({}, any)", self.link.id),
            Some(StepMatch::Exact(step)) => write!(f, "StepLink({}, step {})", self.link.id, step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smachine::slot::Slot;

    fn live_slot(id: u32) -> Arc<Slot> {
        let slot = Arc::new(Slot::detached());
        slot.assign(SlotId::from_u32(id));
        slot
    }

    #[test]
    fn test_unknown_id() {
        assert!(SlotId::UNKNOWN.is_unknown());
        assert!(SlotId::default().is_unknown());
        assert!(!SlotId::from_u32(7).is_unknown());
    }

    #[test]
    fn test_no_link() {
        let link = SlotLink::none();
        assert!(link.is_empty());
        assert!(!link.is_valid());
        assert!(link.slot_id().is_unknown());

        let step_link = StepLink::none();
        assert!(step_link.is_empty());
        assert!(!step_link.is_valid());
        assert!(!step_link.is_at_step());
        assert_eq!(step_link.step(), None);
    }

    #[test]
    fn test_link_invalidated_when_id_changes() {
        let slot = live_slot(5);
        let link = slot.new_link();
        assert!(!link.is_empty());
        assert!(link.is_valid());

        // Recycle the slot for another task
        slot.set_id_and_step(SlotId::from_u32(6), 1);
        assert!(!link.is_valid());
        assert!(!link.is_empty());
    }

    #[test]
    fn test_link_survives_step_change() {
        let slot = live_slot(5);
        let link = slot.new_link();
        slot.advance_step();
        slot.advance_step();
        assert!(link.is_valid());
    }

    #[test]
    fn test_link_invalid_after_slot_dropped() {
        let slot = live_slot(9);
        let link = slot.new_link();
        drop(slot);
        assert!(!link.is_valid());
        assert!(!link.is_empty());
    }

    #[test]
    fn test_any_step_matches_every_step() {
        let slot = live_slot(3);
        let link = slot.new_any_step_link();
        for _ in 0..10 {
            assert!(link.is_at_step());
            slot.advance_step();
        }
        slot.set_id_and_step(SlotId::from_u32(4), 1);
        assert!(!link.is_at_step());
    }

    #[test]
    fn test_exact_step_matches_only_its_step() {
        let slot = live_slot(3);
        slot.advance_step();
        let link = slot.new_exact_step_link();
        assert_eq!(link.step(), Some(StepMatch::Exact(2)));
        assert!(link.is_at_step());

        slot.advance_step();
        assert!(!link.is_at_step());
        assert!(link.is_valid());

        // Same step value under a different id is still stale
        slot.set_id_and_step(SlotId::from_u32(11), 2);
        assert!(!link.is_at_step());
    }

    #[test]
    fn test_link_equality() {
        let slot = live_slot(1);
        assert_eq!(slot.new_link(), slot.new_link());
        assert_ne!(slot.new_link(), SlotLink::none());
        assert_ne!(slot.new_any_step_link(), slot.new_exact_step_link());
    }
}
