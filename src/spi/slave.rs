//! Slave bookkeeping for the SPI bus.
//!
//! The bus carries up to eight slaves, addressed by their position. The
//! table is filled once by enumeration and is read-only afterwards except
//! for the Available/AvailableBusy flip driven by each received info
//! byte. Discovery stops at the first absent address, so the present
//! slaves always form a contiguous prefix.

/// Maximum number of slaves on one SPI bus.
pub const MAX_SLAVES: usize = 8;

/// Presence and flow-control state of one slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlaveStatus {
    /// Not found during enumeration, or not probed yet.
    #[default]
    Absent,
    /// Present and accepting requests.
    Available,
    /// Present but its receive buffer is full; send polls only.
    AvailableBusy,
}

impl SlaveStatus {
    /// Check if the slave answered enumeration.
    #[inline]
    pub fn is_present(&self) -> bool {
        !matches!(self, SlaveStatus::Absent)
    }
}

/// One slave on the bus.
#[derive(Debug, Clone, Default)]
pub struct Slave {
    stack_address: u8,
    status: SlaveStatus,
    uids: Vec<u32>,
}

impl Slave {
    /// Positional bus address (0-7), distinct from any UID.
    #[inline]
    pub fn stack_address(&self) -> u8 {
        self.stack_address
    }

    /// Current status.
    #[inline]
    pub fn status(&self) -> SlaveStatus {
        self.status
    }

    /// UIDs of the devices reachable through this slave.
    #[inline]
    pub fn uids(&self) -> &[u32] {
        &self.uids
    }

    /// Check if a UID belongs to this slave.
    pub fn owns_uid(&self, uid: u32) -> bool {
        self.uids.contains(&uid)
    }
}

/// Fixed-capacity table of the slaves discovered at startup.
#[derive(Debug)]
pub struct SlaveTable {
    slaves: [Slave; MAX_SLAVES],
    slave_num: usize,
}

impl SlaveTable {
    /// Create a table with all addresses absent.
    pub fn new() -> Self {
        let mut slaves: [Slave; MAX_SLAVES] = Default::default();
        for (address, slave) in slaves.iter_mut().enumerate() {
            slave.stack_address = address as u8;
        }

        Self {
            slaves,
            slave_num: 0,
        }
    }

    /// Get a slave by stack address.
    pub fn get(&self, index: usize) -> Option<&Slave> {
        self.slaves.get(index)
    }

    /// Number of present slaves. Indices `[0, slave_num)` are present,
    /// everything above is absent.
    #[inline]
    pub fn slave_num(&self) -> usize {
        self.slave_num
    }

    /// Record how many contiguous slaves enumeration found.
    pub fn set_slave_num(&mut self, slave_num: usize) {
        debug_assert!(slave_num <= MAX_SLAVES);
        self.slave_num = slave_num;
    }

    /// Iterate over the present slaves in address order.
    pub fn present(&self) -> impl Iterator<Item = &Slave> {
        self.slaves[..self.slave_num].iter()
    }

    /// Find the slave owning a UID by linear scan.
    ///
    /// UID 0 is the broadcast address and is never owned by a slave.
    pub fn find_by_uid(&self, uid: u32) -> Option<&Slave> {
        if uid == 0 {
            return None;
        }
        self.present().find(|slave| slave.owns_uid(uid))
    }

    /// Set the status of a slave.
    pub fn set_status(&mut self, index: usize, status: SlaveStatus) {
        if let Some(slave) = self.slaves.get_mut(index) {
            slave.status = status;
        }
    }

    /// Flip a present slave between Available and AvailableBusy from its
    /// last received info byte. Absent slaves stay absent.
    pub fn mark_busy(&mut self, index: usize, busy: bool) {
        if let Some(slave) = self.slaves.get_mut(index) {
            if slave.status.is_present() {
                slave.status = if busy {
                    SlaveStatus::AvailableBusy
                } else {
                    SlaveStatus::Available
                };
            }
        }
    }

    /// Record the UID list a slave reported during enumeration. Zero
    /// UIDs are never recorded.
    pub fn record_uids(&mut self, index: usize, uids: &[u32]) {
        if let Some(slave) = self.slaves.get_mut(index) {
            slave.uids = uids.iter().copied().filter(|&uid| uid != 0).collect();
        }
    }

    /// Total number of UIDs across all present slaves.
    pub fn uid_count(&self) -> usize {
        self.present().map(|slave| slave.uids.len()).sum()
    }

    /// Check if any present slave owns the UID.
    pub fn knows_uid(&self, uid: u32) -> bool {
        self.find_by_uid(uid).is_some()
    }
}

impl Default for SlaveTable {
    fn default() -> Self {
        Self::new()
    }
}
