//! Caller-owned cache of BLE scan results
//!
//! Several BLE clients share one cache so a single scan serves all of them.
//! Entries are claimed by the device id that received them; a claimed entry
//! is never handed to another id, which keeps the descriptor-to-device
//! mapping one-to-one when identical models are present.

use btleplug::platform::{Adapter, Peripheral};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::DeviceId;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::ble::{self, BleDevice, NameMatcher};
use crate::error::DiscoveryError;

/// Default age after which scan results are rescanned before use
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);

struct CacheEntry<P> {
    device: BleDevice<P>,
    claimed_by: Option<DeviceId>,
}

pub struct DiscoveryCache<P = Peripheral> {
    entries: Vec<CacheEntry<P>>,
    scanned_at: Option<Instant>,
    scans: u64,
    max_age: Duration,
    scan_duration: Duration,
    adapter: Option<Adapter>,
}

impl<P: Clone> DiscoveryCache<P> {
    pub fn new(max_age: Duration, scan_duration: Duration) -> Self {
        Self {
            entries: Vec::new(),
            scanned_at: None,
            scans: 0,
            max_age,
            scan_duration,
            adapter: None,
        }
    }

    pub fn scan_duration(&self) -> Duration {
        self.scan_duration
    }

    /// True before the first scan and once the last scan is older than the max age
    pub fn is_stale(&self) -> bool {
        self.scanned_at
            .map_or(true, |at| at.elapsed() > self.max_age)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached devices with the id that claimed each, if any
    pub fn entries(&self) -> impl Iterator<Item = (&BleDevice<P>, Option<&DeviceId>)> {
        self.entries
            .iter()
            .map(|e| (&e.device, e.claimed_by.as_ref()))
    }

    /// Replace the cached scan results; claims carry over by address
    pub fn replace(&mut self, devices: Vec<BleDevice<P>>) {
        let previous = std::mem::take(&mut self.entries);
        self.entries = devices
            .into_iter()
            .map(|device| {
                let claimed_by = previous
                    .iter()
                    .find(|old| old.device.address == device.address)
                    .and_then(|old| old.claimed_by.clone());
                CacheEntry { device, claimed_by }
            })
            .collect();
        self.scanned_at = Some(Instant::now());
        self.scans += 1;
    }

    /// Hand out a matching device to `owner`
    ///
    /// A device already claimed by `owner` is returned again; otherwise the
    /// first unclaimed match is claimed.
    pub fn claim(&mut self, owner: &DeviceId, matcher: &NameMatcher) -> Option<BleDevice<P>> {
        let index = self
            .entries
            .iter()
            .position(|e| e.claimed_by.as_ref() == Some(owner) && matcher.matches(&e.device.name))
            .or_else(|| {
                self.entries
                    .iter()
                    .position(|e| e.claimed_by.is_none() && matcher.matches(&e.device.name))
            })?;

        let entry = &mut self.entries[index];
        entry.claimed_by = Some(owner.clone());
        debug!(
            device = %owner,
            name = %entry.device.name,
            address = %entry.device.address,
            "Claimed BLE device"
        );
        Some(entry.device.clone())
    }

    /// Return every entry claimed by `owner` to the pool
    pub fn release(&mut self, owner: &DeviceId) {
        for entry in &mut self.entries {
            if entry.claimed_by.as_ref() == Some(owner) {
                entry.claimed_by = None;
            }
        }
    }
}

impl DiscoveryCache<Peripheral> {
    /// Rescan and replace the cached results
    pub async fn refresh(&mut self) -> Result<(), DiscoveryError> {
        let adapter = match &self.adapter {
            Some(adapter) => adapter.clone(),
            None => {
                let adapter = ble::default_adapter().await?;
                self.adapter = Some(adapter.clone());
                adapter
            }
        };
        let devices = ble::scan(&adapter, self.scan_duration).await?;
        self.replace(devices);
        Ok(())
    }
}

impl Default for DiscoveryCache<Peripheral> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE, ble::DEFAULT_SCAN_DURATION)
    }
}

fn not_found(matcher: &NameMatcher, scan_duration: Duration) -> DiscoveryError {
    DiscoveryError::NotFound(format!(
        "no unclaimed device named {} within {:?}",
        matcher, scan_duration
    ))
}

/// A `DiscoveryCache` shared between the BLE clients of one orchestrator
///
/// The cache mutex is only held to read or claim entries, never across a
/// scan. At most one scan runs at a time; clients that find the cache stale
/// while a scan is in flight wait for that scan instead of starting another.
pub struct SharedDiscoveryCache<P = Peripheral> {
    inner: Arc<SharedInner<P>>,
}

struct SharedInner<P> {
    cache: Mutex<DiscoveryCache<P>>,
    scan_gate: Mutex<()>,
    adapter: OnceCell<Adapter>,
}

impl<P> Clone for SharedDiscoveryCache<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Clone> SharedDiscoveryCache<P> {
    pub fn new(max_age: Duration, scan_duration: Duration) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                cache: Mutex::new(DiscoveryCache::new(max_age, scan_duration)),
                scan_gate: Mutex::new(()),
                adapter: OnceCell::new(),
            }),
        }
    }

    /// Direct access to the cached entries
    pub async fn lock(&self) -> MutexGuard<'_, DiscoveryCache<P>> {
        self.inner.cache.lock().await
    }

    /// Claim a device for `owner`, running `scan` first if the cache is stale
    ///
    /// A fresh cache without a match fails immediately; the device is looked
    /// for again once the results age out.
    pub async fn claim_with<F, Fut>(
        &self,
        owner: &DeviceId,
        matcher: &NameMatcher,
        scan: F,
    ) -> Result<BleDevice<P>, DiscoveryError>
    where
        F: FnOnce(Duration) -> Fut,
        Fut: Future<Output = Result<Vec<BleDevice<P>>, DiscoveryError>>,
    {
        let seen = {
            let mut cache = self.inner.cache.lock().await;
            if !cache.is_stale() {
                let scan_duration = cache.scan_duration;
                return cache
                    .claim(owner, matcher)
                    .ok_or_else(|| not_found(matcher, scan_duration));
            }
            cache.scans
        };

        let gate = self.inner.scan_gate.lock().await;
        let pending = {
            let cache = self.inner.cache.lock().await;
            (cache.scans == seen).then_some(cache.scan_duration)
        };
        match pending {
            Some(duration) => {
                info!(device = %owner, matcher = %matcher, "Scanning for BLE devices");
                let devices = scan(duration).await?;
                self.inner.cache.lock().await.replace(devices);
            }
            None => debug!(device = %owner, "Using results of a concurrent scan"),
        }
        drop(gate);

        let mut cache = self.inner.cache.lock().await;
        let scan_duration = cache.scan_duration;
        cache
            .claim(owner, matcher)
            .ok_or_else(|| not_found(matcher, scan_duration))
    }
}

impl SharedDiscoveryCache<Peripheral> {
    /// Claim from fresh results, scanning the default adapter when stale
    pub async fn claim_or_scan(
        &self,
        owner: &DeviceId,
        matcher: &NameMatcher,
    ) -> Result<BleDevice, DiscoveryError> {
        self.claim_with(owner, matcher, |duration| async move {
            let adapter = self.adapter().await?;
            ble::scan(&adapter, duration).await
        })
        .await
    }

    async fn adapter(&self) -> Result<Adapter, DiscoveryError> {
        self.inner
            .adapter
            .get_or_try_init(ble::default_adapter)
            .await
            .cloned()
    }
}
