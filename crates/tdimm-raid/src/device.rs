//! RAID device: a member table driven by one composition strategy

use crate::member::{MemberDevice, MemberState, MemberTable, check_compatible};
use crate::metadata::{ConfigKey, LEVELS, RaidMetadata, level_code};
use crate::registry::StrategyRegistry;
use crate::strategy::RaidStrategy;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tdimm_common::{
    Error, Geometry, IoError, MAX_RAID_MEMBERS, RaidConfig, Result, is_sector_aligned,
};
use tdimm_engine::Request;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Aggregate health of a RAID set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidState {
    /// Every slot the set spans has a live member
    Optimal,
    /// Members are missing or dead but the level still serves I/O
    Degraded,
    Failed,
}

impl std::fmt::Display for RaidState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Optimal => "optimal",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        })
    }
}

/// A RAID set over member devices
pub struct RaidDevice {
    name: String,
    uuid: Uuid,
    config: RaidConfig,
    strategy: Box<dyn RaidStrategy>,
    members: RwLock<MemberTable>,
    /// Slots the set spans, including missing members
    width: Mutex<usize>,
    /// Block parameters of the first member that joined
    reference: Mutex<Option<Geometry>>,
}

impl std::fmt::Debug for RaidDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaidDevice")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("strategy", &self.strategy)
            .field("members", &self.members.read().mask())
            .field("width", &*self.width.lock())
            .finish_non_exhaustive()
    }
}

impl RaidDevice {
    /// Create an empty set of the level `config.level` names
    pub fn create(config: RaidConfig, registry: &StrategyRegistry) -> Result<Self> {
        Self::with_uuid(config, registry, Uuid::new_v4())
    }

    fn with_uuid(config: RaidConfig, registry: &StrategyRegistry, uuid: Uuid) -> Result<Self> {
        let strategy = registry.create(&config)?;
        info!("raid {}: created {} set {}", config.name, strategy.name(), uuid);
        Ok(Self {
            name: config.name.clone(),
            uuid,
            config,
            strategy,
            members: RwLock::new(MemberTable::new()),
            width: Mutex::new(0),
            reference: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub const fn config(&self) -> &RaidConfig {
        &self.config
    }

    #[must_use]
    pub fn level(&self) -> &'static str {
        self.strategy.name()
    }

    /// Attach a device at the lowest free slot
    pub fn add_member(&self, device: Arc<dyn MemberDevice>) -> Result<usize> {
        let mut members = self.members.write();
        self.check_member(&device)?;
        let name = device.name().to_string();
        let slot = members.push(device)?;
        self.joined(slot, &name);
        Ok(slot)
    }

    /// Attach a device at a specific slot
    pub fn add_member_at(&self, slot: usize, device: Arc<dyn MemberDevice>) -> Result<()> {
        let mut members = self.members.write();
        self.check_member(&device)?;
        let name = device.name().to_string();
        members.insert(slot, device)?;
        self.joined(slot, &name);
        Ok(())
    }

    fn check_member(&self, device: &Arc<dyn MemberDevice>) -> Result<()> {
        let geometry = device.geometry();
        let mut reference = self.reference.lock();
        match *reference {
            Some(ref r) => check_compatible(r, &geometry, device.name()),
            None => {
                *reference = Some(geometry);
                Ok(())
            }
        }
    }

    fn joined(&self, slot: usize, name: &str) {
        let mut width = self.width.lock();
        *width = (*width).max(slot + 1);
        info!("raid {}: {} joined at slot {} (width {})", self.name, name, slot, *width);
    }

    /// Detach the member at `slot`; the slot stays part of the set
    pub fn remove_member(&self, slot: usize) -> Result<()> {
        let member = self.members.write().remove(slot)?;
        warn!("raid {}: {} left slot {}", self.name, member.device.name(), slot);
        Ok(())
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    #[must_use]
    pub fn width(&self) -> usize {
        *self.width.lock()
    }

    /// Members by slot across the width of the set
    #[must_use]
    pub fn slots(&self) -> Vec<Option<Arc<dyn MemberDevice>>> {
        let members = self.members.read();
        (0..self.width())
            .map(|i| members.get(i).map(|m| Arc::clone(&m.device)))
            .collect()
    }

    #[must_use]
    pub fn state(&self) -> RaidState {
        let width = self.width();
        let healthy = self
            .members
            .read()
            .iter()
            .filter(|(_, m)| m.device.is_alive())
            .count();
        if width > 0 && healthy == width {
            RaidState::Optimal
        } else if self.strategy.survives(healthy, width) {
            RaidState::Degraded
        } else {
            RaidState::Failed
        }
    }

    /// Block parameters the set exposes, once a member has joined
    #[must_use]
    pub fn geometry(&self) -> Option<Geometry> {
        let reference = (*self.reference.lock())?;
        Some(Geometry {
            capacity_bytes: self.strategy.capacity(&reference, self.width()),
            ..reference
        })
    }

    /// Queue a request to the members; it completes asynchronously
    pub fn queue_request(&self, request: Request) {
        if self.state() == RaidState::Failed {
            debug!("raid {}: failing request on failed set", self.name);
            request.complete(Err(IoError::Io));
            return;
        }
        let valid = self.geometry().is_some_and(|geo| {
            request.size > 0
                && is_sector_aligned(request.offset)
                && is_sector_aligned(request.size)
                && geo.contains(request.offset, request.size)
        });
        if !valid {
            warn!(
                "raid {}: rejecting {} {}+{}",
                self.name, request.direction, request.offset, request.size
            );
            request.complete(Err(IoError::Invalid));
            return;
        }
        let slots = self.slots();
        if let Err(rejected) = self.strategy.submit(request, &slots) {
            warn!("raid {}: {}", self.name, rejected.error);
            rejected.fail();
        }
    }

    /// Metadata block for the member at `slot`
    pub fn metadata(&self, slot: usize) -> Result<RaidMetadata> {
        let members = self.members.read();
        let owner = members.get(slot).ok_or(Error::SlotEmpty(slot))?;
        let index = u32::try_from(slot).map_err(|_| Error::SlotEmpty(slot))?;
        let mut md = RaidMetadata::new(self.uuid, owner.uuid, index);

        let level = level_code(self.strategy.name())
            .ok_or_else(|| Error::UnknownRaidLevel(self.strategy.name().to_string()))?;
        md.set_entry(ConfigKey::Level as u32, level)?;
        md.set_entry(ConfigKey::Width as u32, self.width() as u64)?;
        for (key, value) in self.strategy.parameters() {
            md.set_entry(key, value)?;
        }
        for (i, record) in md.members.iter_mut().enumerate().take(self.width()) {
            match members.get(i) {
                Some(m) => {
                    record.uuid = m.uuid;
                    record.state = MemberState::Active;
                }
                None => record.state = MemberState::Missing,
            }
        }
        Ok(md)
    }

    /// Rebuild a set from member metadata blocks and the devices found
    ///
    /// Each device goes back to the slot recorded for its UUID; recorded
    /// members that were not found leave their slot empty.
    pub fn assemble(
        name: &str,
        blocks: &[RaidMetadata],
        devices: &[Arc<dyn MemberDevice>],
        registry: &StrategyRegistry,
    ) -> Result<Self> {
        let first = blocks
            .first()
            .ok_or_else(|| Error::corrupt("no metadata blocks to assemble from"))?;
        if let Some(other) = blocks.iter().find(|b| b.raid_uuid != first.raid_uuid) {
            return Err(Error::corrupt(format!(
                "member {} belongs to set {}, not {}",
                other.member_uuid, other.raid_uuid, first.raid_uuid
            )));
        }

        let level = first
            .entry(ConfigKey::Level)
            .and_then(|c| usize::try_from(c).ok())
            .and_then(|c| LEVELS.get(c))
            .ok_or_else(|| Error::corrupt("metadata names no known level"))?;
        let defaults = RaidConfig::default();
        let config = RaidConfig {
            name: name.to_string(),
            level: (*level).to_string(),
            stride_sectors: entry_u32(first, ConfigKey::StrideSectors, defaults.stride_sectors),
            read_stride_sectors: entry_u32(
                first,
                ConfigKey::ReadStrideSectors,
                defaults.read_stride_sectors,
            ),
        };
        let device = Self::with_uuid(config, registry, first.raid_uuid)?;

        for dev in devices {
            let uuid = dev.uuid();
            let Some(slot) = first.members.iter().position(|r| r.uuid == uuid) else {
                warn!("raid {}: {} is not a member, skipped", name, dev.name());
                continue;
            };
            device.add_member_at(slot, Arc::clone(dev))?;
        }

        let recorded = first
            .entry(ConfigKey::Width)
            .and_then(|w| usize::try_from(w).ok())
            .unwrap_or(0)
            .min(MAX_RAID_MEMBERS);
        {
            let mut width = device.width.lock();
            *width = (*width).max(recorded);
        }
        info!(
            "raid {}: assembled {} of {} members, {}",
            name,
            device.member_count(),
            device.width(),
            device.state()
        );
        Ok(device)
    }
}

fn entry_u32(md: &RaidMetadata, key: ConfigKey, default: u32) -> u32 {
    md.entry(key)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(default)
}

impl MemberDevice for RaidDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn geometry(&self) -> Geometry {
        self.geometry().unwrap_or(Geometry::new(0, 512, 0))
    }

    fn queue_request(&self, request: Request) {
        Self::queue_request(self, request);
    }

    fn is_alive(&self) -> bool {
        self.state() != RaidState::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::testing::MemDevice;
    use std::time::Duration;
    use tdimm_common::{Direction, EngineConfig, IoResult};
    use tdimm_engine::{DevGroup, Engine, IoBuf, RunState, SimConfig, SimHal};

    fn config(level: &str) -> RaidConfig {
        RaidConfig {
            name: "md0".into(),
            level: level.into(),
            stride_sectors: 8,
            read_stride_sectors: 8,
        }
    }

    fn tracked(request: Request) -> (Request, Arc<parking_lot::Mutex<Option<IoResult>>>) {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let s = Arc::clone(&seen);
        (request.on_complete(move |res, _| *s.lock() = Some(res)), seen)
    }

    fn set_of(level: &str, n: usize) -> (RaidDevice, Vec<Arc<MemDevice>>) {
        let raid = RaidDevice::create(config(level), &StrategyRegistry::default()).unwrap();
        let devs: Vec<_> = (0..n).map(|i| MemDevice::new(&format!("m{i}"), 1 << 20)).collect();
        for dev in &devs {
            raid.add_member(Arc::clone(dev) as Arc<dyn MemberDevice>).unwrap();
        }
        (raid, devs)
    }

    #[test]
    fn test_one_sector_at_40_lands_on_member_1() {
        let (raid, devs) = set_of("stripe", 4);
        assert_eq!(raid.geometry().unwrap().capacity_bytes, 4 << 20);
        let (req, done) = tracked(Request::write(40 * 512, IoBuf::from_vec(vec![0xAB; 512])));
        raid.queue_request(req);
        assert_eq!(*done.lock(), Some(Ok(())));
        assert_eq!(*devs[1].log.lock(), vec![(Direction::Write, 8 * 512, 512)]);
        assert_eq!(&devs[1].data.lock()[4096..4608], &[0xAB; 512][..]);
    }

    #[test]
    fn test_stripe_state_follows_members() {
        let (raid, devs) = set_of("stripe", 3);
        assert_eq!(raid.state(), RaidState::Optimal);
        devs[2].kill();
        assert_eq!(raid.state(), RaidState::Failed);

        let (req, done) = tracked(Request::read(0, IoBuf::zeroed(512)));
        raid.queue_request(req);
        assert_eq!(*done.lock(), Some(Err(IoError::Io)));
    }

    #[test]
    fn test_mirror_degrades_then_fails() {
        let (raid, devs) = set_of("mirror", 2);
        assert_eq!(raid.state(), RaidState::Optimal);
        raid.remove_member(0).unwrap();
        assert_eq!(raid.state(), RaidState::Degraded);
        assert_eq!(raid.width(), 2);

        let (req, done) = tracked(Request::write(0, IoBuf::from_vec(vec![1; 4096])));
        raid.queue_request(req);
        assert_eq!(*done.lock(), Some(Ok(())));
        assert!(devs[0].log.lock().is_empty());

        devs[1].kill();
        assert_eq!(raid.state(), RaidState::Failed);
    }

    #[test]
    fn test_mismatched_member_refused() {
        let (raid, _devs) = set_of("stripe", 1);
        let odd = MemDevice::new("odd", 2 << 20);
        assert!(matches!(
            raid.add_member(odd as Arc<dyn MemberDevice>),
            Err(Error::MemberMismatch(_))
        ));
        assert_eq!(raid.member_count(), 1);
    }

    #[test]
    fn test_invalid_requests() {
        let (raid, _devs) = set_of("stripe", 2);
        let capacity = raid.geometry().unwrap().capacity_bytes;
        for req in [
            Request::read(100, IoBuf::zeroed(512)),
            Request::read(capacity, IoBuf::zeroed(512)),
            Request::new(Direction::Discard, 0, 0),
        ] {
            let (req, done) = tracked(req);
            raid.queue_request(req);
            assert_eq!(*done.lock(), Some(Err(IoError::Invalid)));
        }

        let empty = RaidDevice::create(config("stripe"), &StrategyRegistry::default()).unwrap();
        assert_eq!(empty.state(), RaidState::Failed);
        assert!(empty.geometry().is_none());
    }

    #[test]
    fn test_assemble_from_metadata_files() {
        let (raid, devs) = set_of("stripe", 3);
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for slot in 0..3 {
            let path = dir.path().join(format!("m{slot}.md"));
            raid.metadata(slot).unwrap().write_to(&path).unwrap();
            paths.push(path);
        }
        let blocks: Vec<_> = paths
            .iter()
            .map(|p| RaidMetadata::read_from(p).unwrap())
            .collect();

        // found out of order, one missing
        let found: Vec<Arc<dyn MemberDevice>> = vec![
            Arc::clone(&devs[2]) as Arc<dyn MemberDevice>,
            Arc::clone(&devs[0]) as Arc<dyn MemberDevice>,
        ];
        let back = RaidDevice::assemble("md0", &blocks, &found, &StrategyRegistry::default()).unwrap();
        assert_eq!(back.uuid(), raid.uuid());
        assert_eq!(back.level(), "stripe");
        assert_eq!(back.config().stride_sectors, 8);
        assert_eq!(back.width(), 3);
        assert_eq!(back.state(), RaidState::Failed);
        assert_eq!(back.metadata(2).unwrap().members[1].state, MemberState::Missing);

        back.add_member_at(1, Arc::clone(&devs[1]) as Arc<dyn MemberDevice>).unwrap();
        assert_eq!(back.state(), RaidState::Optimal);
    }

    #[test]
    fn test_assemble_rejects_foreign_blocks() {
        let (a, _) = set_of("mirror", 1);
        let (b, _) = set_of("mirror", 1);
        let blocks = [a.metadata(0).unwrap(), b.metadata(0).unwrap()];
        assert!(RaidDevice::assemble("x", &blocks, &[], &StrategyRegistry::default()).is_err());
        assert!(RaidDevice::assemble("x", &[], &[], &StrategyRegistry::default()).is_err());
    }

    fn engine(name: &str) -> Engine {
        let (hal, _control) = SimHal::new(SimConfig {
            name: name.to_string(),
            capacity_bytes: 4 << 20,
            ..SimConfig::default()
        });
        let config = EngineConfig {
            name: name.to_string(),
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(config, Box::new(hal)).unwrap();
        engine.start().unwrap();
        engine
    }

    #[test]
    fn test_stripe_over_engines() {
        let mut group = DevGroup::new("raid", 2, Duration::from_millis(1)).unwrap();
        let raid = RaidDevice::create(config("stripe"), &StrategyRegistry::default()).unwrap();
        for i in 0..3 {
            let item = group.add_engine(engine(&format!("e{i}")));
            item.handle()
                .wait_for(RunState::Running, Duration::from_secs(5))
                .unwrap();
            raid.add_member(Arc::new(item.handle().clone())).unwrap();
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 253) as u8).collect();
        let t = tx.clone();
        raid.queue_request(
            Request::write(3 * 512, IoBuf::from_vec(data.clone()))
                .on_complete(move |res, _| t.send(res).unwrap()),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));

        let buf = IoBuf::zeroed(data.len());
        raid.queue_request(
            Request::read(3 * 512, buf.clone()).on_complete(move |res, _| tx.send(res).unwrap()),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
        assert_eq!(buf.to_vec(), data);
        group.shutdown();
    }
}
