//! RAID member table
//!
//! A RAID device has a fixed number of member slots. Occupied slots are
//! tracked in a presence mask; each slot holds a counted reference to the
//! backing device for as long as the member is attached.

use std::sync::Arc;
use tdimm_common::{Error, Geometry, MAX_RAID_MEMBERS, Result};
use tdimm_engine::{EngineHandle, Request, RunState};
use uuid::Uuid;

/// Block device a RAID set can be built from
pub trait MemberDevice: Send + Sync {
    fn name(&self) -> &str;

    fn uuid(&self) -> Uuid;

    fn geometry(&self) -> Geometry;

    /// Queue a request; it completes asynchronously
    fn queue_request(&self, request: Request);

    /// Whether the device can still serve I/O
    fn is_alive(&self) -> bool {
        true
    }
}

impl MemberDevice for EngineHandle {
    fn name(&self) -> &str {
        Self::name(self)
    }

    fn uuid(&self) -> Uuid {
        Self::uuid(self)
    }

    fn geometry(&self) -> Geometry {
        Self::geometry(self)
    }

    fn queue_request(&self, request: Request) {
        Self::queue_request(self, request);
    }

    fn is_alive(&self) -> bool {
        !matches!(self.state(), RunState::Terminating | RunState::Dead)
    }
}

/// Membership state recorded in metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemberState {
    #[default]
    Empty,
    Active,
    /// Known from metadata but not attached
    Missing,
}

impl From<u8> for MemberState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Active,
            2 => Self::Missing,
            _ => Self::Empty,
        }
    }
}

impl From<MemberState> for u8 {
    fn from(state: MemberState) -> Self {
        match state {
            MemberState::Empty => 0,
            MemberState::Active => 1,
            MemberState::Missing => 2,
        }
    }
}

/// An attached member
#[derive(Clone)]
pub struct Member {
    pub device: Arc<dyn MemberDevice>,
    pub uuid: Uuid,
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("name", &self.device.name())
            .field("uuid", &self.uuid)
            .finish()
    }
}

/// Fixed-size member slot array with a presence mask
#[derive(Debug, Clone, Default)]
pub struct MemberTable {
    slots: [Option<Member>; MAX_RAID_MEMBERS],
    mask: u32,
}

impl MemberTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Presence bitmask, bit `i` set when slot `i` is occupied
    #[must_use]
    pub const fn mask(&self) -> u32 {
        self.mask
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.mask.count_ones() as usize
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.mask == 0
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&Member> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Attach a device at `slot`
    pub fn insert(&mut self, slot: usize, device: Arc<dyn MemberDevice>) -> Result<()> {
        if slot >= MAX_RAID_MEMBERS {
            return Err(Error::configuration(format!(
                "member slot {slot} out of range (max {MAX_RAID_MEMBERS})"
            )));
        }
        if self.slots[slot].is_some() {
            return Err(Error::SlotOccupied(slot));
        }
        let uuid = device.uuid();
        self.slots[slot] = Some(Member { device, uuid });
        self.mask |= 1 << slot;
        Ok(())
    }

    /// Attach a device at the lowest free slot
    pub fn push(&mut self, device: Arc<dyn MemberDevice>) -> Result<usize> {
        let slot = (!self.mask).trailing_zeros() as usize;
        if slot >= MAX_RAID_MEMBERS {
            return Err(Error::NoFreeSlot);
        }
        self.insert(slot, device)?;
        Ok(slot)
    }

    /// Detach the member at `slot`, dropping the table's reference
    pub fn remove(&mut self, slot: usize) -> Result<Member> {
        let member = self
            .slots
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or(Error::SlotEmpty(slot))?;
        self.mask &= !(1 << slot);
        Ok(member)
    }

    /// Occupied slots in ascending order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Member)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.as_ref().map(|m| (i, m)))
    }

    /// Member devices in slot order
    #[must_use]
    pub fn devices(&self) -> Vec<Arc<dyn MemberDevice>> {
        self.iter().map(|(_, m)| Arc::clone(&m.device)).collect()
    }

    /// Slot holding the device with `uuid`
    #[must_use]
    pub fn find(&self, uuid: Uuid) -> Option<usize> {
        self.iter().find(|(_, m)| m.uuid == uuid).map(|(i, _)| i)
    }

    /// Geometry of the lowest occupied slot, which new members are checked
    /// against
    #[must_use]
    pub fn reference_geometry(&self) -> Option<Geometry> {
        self.iter().next().map(|(_, m)| m.device.geometry())
    }
}

/// Refuse a member whose block parameters differ from the reference
pub fn check_compatible(reference: &Geometry, candidate: &Geometry, name: &str) -> Result<()> {
    if reference.sector_size != candidate.sector_size {
        return Err(Error::member_mismatch(format!(
            "{name}: sector size {} differs from {}",
            candidate.sector_size, reference.sector_size
        )));
    }
    if reference.capacity_bytes != candidate.capacity_bytes {
        return Err(Error::member_mismatch(format!(
            "{name}: capacity {} differs from {}",
            candidate.capacity_bytes, reference.capacity_bytes
        )));
    }
    if reference.max_request_bytes != candidate.max_request_bytes {
        return Err(Error::member_mismatch(format!(
            "{name}: max request {} differs from {}",
            candidate.max_request_bytes, reference.max_request_bytes
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::MemDevice;
    use super::*;

    #[test]
    fn test_push_fills_lowest_slot() {
        let mut table = MemberTable::new();
        for i in 0..3 {
            let slot = table.push(MemDevice::new(&format!("m{i}"), 1 << 20)).unwrap();
            assert_eq!(slot, i);
        }
        table.remove(1).unwrap();
        assert_eq!(table.mask(), 0b101);
        assert_eq!(table.push(MemDevice::new("m3", 1 << 20)).unwrap(), 1);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_slot_errors() {
        let mut table = MemberTable::new();
        table.insert(4, MemDevice::new("a", 1 << 20)).unwrap();
        assert!(matches!(
            table.insert(4, MemDevice::new("b", 1 << 20)),
            Err(Error::SlotOccupied(4))
        ));
        assert!(matches!(table.remove(5), Err(Error::SlotEmpty(5))));
        assert!(table.insert(MAX_RAID_MEMBERS, MemDevice::new("c", 1 << 20)).is_err());

        for i in 0..MAX_RAID_MEMBERS - 1 {
            table.push(MemDevice::new(&format!("f{i}"), 1 << 20)).unwrap();
        }
        assert_eq!(table.mask(), u32::MAX);
        assert!(matches!(table.push(MemDevice::new("x", 1 << 20)), Err(Error::NoFreeSlot)));
    }

    #[test]
    fn test_remove_drops_reference() {
        let mut table = MemberTable::new();
        let dev = MemDevice::new("a", 1 << 20);
        let slot = table.push(dev.clone()).unwrap();
        assert_eq!(Arc::strong_count(&dev), 2);
        assert_eq!(table.find(dev.uuid()), Some(slot));
        drop(table.remove(slot).unwrap());
        assert_eq!(Arc::strong_count(&dev), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_compatibility_check() {
        let a = Geometry::new(1 << 20, 512, 4096);
        check_compatible(&a, &a, "same").unwrap();
        assert!(check_compatible(&a, &Geometry::new(1 << 21, 512, 4096), "cap").is_err());
        assert!(check_compatible(&a, &Geometry::new(1 << 20, 4096, 4096), "sect").is_err());
        assert!(check_compatible(&a, &Geometry::new(1 << 20, 512, 8192), "max").is_err());
    }

    #[test]
    fn test_member_state_codes() {
        for state in [MemberState::Empty, MemberState::Active, MemberState::Missing] {
            assert_eq!(MemberState::from(u8::from(state)), state);
        }
        assert_eq!(MemberState::from(9), MemberState::Empty);
    }
}
