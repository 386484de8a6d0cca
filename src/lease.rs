//! Primary leases.
//!
//! The master keeps a [`LeaseTable`] and never lets two leases on one chunk
//! overlap: a new holder is only granted once the previous expiry, plus the
//! clock skew bound, is in the past. Chunkservers keep [`HeldLeases`] and
//! refuse primary-only work once their own clock passes the expiry, whether
//! or not a revoke ever arrives. Secondaries remember which server is the
//! primary of record for each version in [`PrimaryRecord`].

use std::collections::HashMap;

use crate::core::{Address, Chunk, ChunkHandle, GfsError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: Address,
    pub version: u64,
    pub expires_ms: u64,
}

#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: HashMap<ChunkHandle, Lease>,
    clock_skew_ms: u64,
}

impl LeaseTable {
    pub fn new(clock_skew_ms: u64) -> LeaseTable {
        LeaseTable { leases: HashMap::new(), clock_skew_ms }
    }

    /// The unexpired lease on `handle`, if any.
    pub fn active(&self, handle: ChunkHandle, now_ms: u64) -> Option<&Lease> {
        self.leases.get(&handle).filter(|lease| now_ms < lease.expires_ms)
    }

    /// Whether a lease may go to a new holder. False while any server could
    /// still believe it holds the previous lease.
    pub fn can_grant(&self, handle: ChunkHandle, now_ms: u64) -> bool {
        match self.leases.get(&handle) {
            None => true,
            Some(lease) => now_ms > lease.expires_ms + self.clock_skew_ms,
        }
    }

    /// Earliest time a new holder may be granted a lease on `handle`.
    pub fn grantable_at(&self, handle: ChunkHandle) -> Option<u64> {
        self.leases.get(&handle).map(|lease| lease.expires_ms + self.clock_skew_ms + 1)
    }

    pub fn grant(&mut self, handle: ChunkHandle, lease: Lease, now_ms: u64) -> Result<()> {
        if !self.can_grant(handle, now_ms) {
            return Err(GfsError::Unavailable(format!(
                "chunk {handle} lease still outstanding until {:?}",
                self.grantable_at(handle)
            )));
        }
        self.leases.insert(handle, lease);
        Ok(())
    }

    /// Push out the expiry of the current holder's unexpired lease.
    pub fn extend(&mut self, handle: ChunkHandle, holder: &str, expires_ms: u64, now_ms: u64) -> Result<()> {
        match self.leases.get_mut(&handle) {
            Some(lease) if lease.holder == holder && now_ms < lease.expires_ms => {
                lease.expires_ms = lease.expires_ms.max(expires_ms);
                Ok(())
            }
            _ => Err(GfsError::stale(handle, format!("{holder} holds no active lease"))),
        }
    }

    /// The holder acknowledged a revoke, so nobody acts as primary any more.
    pub fn revoked(&mut self, handle: ChunkHandle) {
        self.leases.remove(&handle);
    }

    pub fn get(&self, handle: ChunkHandle) -> Option<&Lease> {
        self.leases.get(&handle)
    }

    /// Drop leases past expiry plus skew. Returns how many were dropped.
    pub fn forget_lapsed(&mut self, now_ms: u64) -> usize {
        let before = self.leases.len();
        let skew = self.clock_skew_ms;
        self.leases.retain(|_, lease| now_ms <= lease.expires_ms + skew);
        before - self.leases.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLease {
    pub version: u64,
    pub expires_ms: u64,
    /// Replicas that must apply every mutation this primary orders.
    pub secondaries: Vec<Address>,
}

/// Leases this chunkserver holds as primary.
#[derive(Debug, Default)]
pub struct HeldLeases {
    leases: HashMap<ChunkHandle, HeldLease>,
}

impl HeldLeases {
    pub fn grant(&mut self, chunk: Chunk, expires_ms: u64, secondaries: Vec<Address>) {
        self.leases.insert(chunk.handle, HeldLease { version: chunk.version, expires_ms, secondaries });
    }

    pub fn revoke(&mut self, handle: ChunkHandle) -> Option<HeldLease> {
        self.leases.remove(&handle)
    }

    /// The lease for `chunk` if it is unexpired by the local clock and at the same version.
    pub fn check(&self, chunk: Chunk, now_ms: u64) -> Result<&HeldLease> {
        let lease = self
            .leases
            .get(&chunk.handle)
            .ok_or_else(|| GfsError::stale(chunk.handle, "not the primary"))?;
        if now_ms >= lease.expires_ms {
            return Err(GfsError::stale(chunk.handle, format!("lease expired at {}", lease.expires_ms)));
        }
        if lease.version != chunk.version {
            return Err(GfsError::stale(
                chunk.handle,
                format!("lease is for version {}, request has {}", lease.version, chunk.version),
            ));
        }
        Ok(lease)
    }

    pub fn forget_expired(&mut self, now_ms: u64) -> usize {
        let before = self.leases.len();
        self.leases.retain(|_, lease| now_ms < lease.expires_ms);
        before - self.leases.len()
    }
}

/// Which server is primary for each chunk version, as told by the master.
#[derive(Debug, Default)]
pub struct PrimaryRecord {
    primaries: HashMap<ChunkHandle, (u64, Address)>,
}

impl PrimaryRecord {
    pub fn record(&mut self, chunk: Chunk, primary: Address) {
        self.primaries.insert(chunk.handle, (chunk.version, primary));
    }

    pub fn forget(&mut self, handle: ChunkHandle) {
        self.primaries.remove(&handle);
    }

    /// Accept a mutation only from the primary of record for exactly this version.
    pub fn check(&self, chunk: Chunk, from: &str) -> Result<()> {
        match self.primaries.get(&chunk.handle) {
            Some((version, primary)) if *version == chunk.version && primary == from => Ok(()),
            Some((version, primary)) => Err(GfsError::stale(
                chunk.handle,
                format!("{from} at version {} is not the primary ({primary} at {version})", chunk.version),
            )),
            None => Err(GfsError::stale(chunk.handle, format!("no primary recorded, {from} refused"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: &str, version: u64, expires_ms: u64) -> Lease {
        Lease { holder: holder.to_string(), version, expires_ms }
    }

    #[test]
    fn no_overlapping_grant_before_expiry_plus_skew() {
        let mut table = LeaseTable::new(100);
        table.grant(1, lease("cs-a", 1, 1_000), 0).unwrap();

        assert!(table.active(1, 999).is_some());
        assert!(table.active(1, 1_000).is_none());
        // Expired, but within the skew bound.
        assert!(table.grant(1, lease("cs-b", 2, 2_000), 1_050).is_err());
        assert!(!table.can_grant(1, 1_100));
        assert_eq!(table.grantable_at(1), Some(1_101));
        table.grant(1, lease("cs-b", 2, 2_000), 1_101).unwrap();
        assert_eq!(table.get(1).unwrap().holder, "cs-b");
    }

    #[test]
    fn acknowledged_revoke_frees_the_chunk() {
        let mut table = LeaseTable::new(100);
        table.grant(1, lease("cs-a", 1, 10_000), 0).unwrap();
        table.revoked(1);
        assert!(table.can_grant(1, 1));
    }

    #[test]
    fn lapsed_leases_are_forgotten() {
        let mut table = LeaseTable::new(100);
        table.grant(1, lease("cs-a", 1, 1_000), 0).unwrap();
        table.grant(2, lease("cs-a", 1, 5_000), 0).unwrap();

        // Expired but still inside the skew bound.
        assert_eq!(table.forget_lapsed(1_100), 0);
        assert!(!table.can_grant(1, 1_100));
        assert_eq!(table.forget_lapsed(1_101), 1);
        assert!(table.get(1).is_none());
        assert!(table.get(2).is_some());
    }

    #[test]
    fn only_the_holder_extends() {
        let mut table = LeaseTable::new(0);
        table.grant(1, lease("cs-a", 1, 1_000), 0).unwrap();

        assert!(table.extend(1, "cs-b", 5_000, 500).is_err());
        table.extend(1, "cs-a", 5_000, 500).unwrap();
        assert_eq!(table.get(1).unwrap().expires_ms, 5_000);
        assert!(table.extend(1, "cs-a", 9_000, 6_000).is_err());
    }

    #[test]
    fn held_lease_checks_clock_and_version() {
        let mut held = HeldLeases::default();
        held.grant(Chunk::new(1, 2), 1_000, vec!["cs-b".into()]);

        assert_eq!(held.check(Chunk::new(1, 2), 999).unwrap().secondaries, vec!["cs-b".to_string()]);
        assert!(held.check(Chunk::new(1, 2), 1_000).is_err());
        assert!(held.check(Chunk::new(1, 1), 10).is_err());
        assert!(held.check(Chunk::new(2, 2), 10).is_err());
        assert_eq!(held.forget_expired(1_000), 1);
    }

    #[test]
    fn primary_record_gates_mutations() {
        let mut record = PrimaryRecord::default();
        assert!(record.check(Chunk::new(1, 1), "cs-a").is_err());

        record.record(Chunk::new(1, 2), "cs-a".into());
        record.check(Chunk::new(1, 2), "cs-a").unwrap();
        assert!(record.check(Chunk::new(1, 2), "cs-b").is_err());
        assert!(record.check(Chunk::new(1, 1), "cs-a").is_err());
    }
}
