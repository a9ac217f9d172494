//! File resource with a mutex-guarded lifecycle state machine

use super::sidecar::ResourceSidecar;
use super::{FileName, ResourceStatus, StreamKind, RESOURCE_SUFFIX};
use crate::interval::Interval;
use crate::{FoldError, Result, SeriesKey, Timestamp};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metadata record of one data file
pub struct FileResource {
    name: FileName,
    path: PathBuf,
    stream: StreamKind,
    bounds: RwLock<Bounds>,
    state: Mutex<Lifecycle>,
    unpinned: Condvar,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Bounds {
    pub(crate) devices: BTreeMap<String, Interval>,
    pub(crate) series: BTreeMap<SeriesKey, Interval>,
    pub(crate) file_size: u64,
}

#[derive(Debug)]
struct Lifecycle {
    status: ResourceStatus,
    pins: usize,
}

impl FileResource {
    /// Resource of a file that is about to be written (UNCLOSED)
    pub fn new(path: PathBuf, stream: StreamKind) -> Result<Self> {
        let name = Self::name_from_path(&path)?;
        Ok(Self::with_parts(
            name,
            path,
            stream,
            Bounds::default(),
            ResourceStatus::Unclosed,
        ))
    }

    pub(crate) fn with_parts(
        name: FileName,
        path: PathBuf,
        stream: StreamKind,
        bounds: Bounds,
        status: ResourceStatus,
    ) -> Self {
        Self {
            name,
            path,
            stream,
            bounds: RwLock::new(bounds),
            state: Mutex::new(Lifecycle { status, pins: 0 }),
            unpinned: Condvar::new(),
        }
    }

    fn name_from_path(path: &Path) -> Result<FileName> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FoldError::InvalidFormat(format!("bad data file path {:?}", path)))?;
        FileName::parse(file_name)
    }

    pub fn name(&self) -> FileName {
        self.name
    }

    /// Data file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sidecar path (`<data file>.resource`)
    pub fn resource_path(&self) -> PathBuf {
        Self::sidecar_path(&self.path)
    }

    pub(crate) fn sidecar_path(data_path: &Path) -> PathBuf {
        let mut os = data_path.as_os_str().to_owned();
        os.push(RESOURCE_SUFFIX);
        PathBuf::from(os)
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn status(&self) -> ResourceStatus {
        self.state.lock().status
    }

    fn ensure_unclosed(&self) -> Result<()> {
        if self.status() != ResourceStatus::Unclosed {
            return Err(FoldError::ResourceSealed(self.name.to_string()));
        }
        Ok(())
    }

    /// Widen the device's start bound to `t`
    pub fn update_start_time(&self, device: &str, t: Timestamp) -> Result<()> {
        self.ensure_unclosed()?;
        let mut bounds = self.bounds.write();
        match bounds.devices.get_mut(device) {
            Some(iv) if t < iv.start() => *iv = Interval::new(t, iv.end()),
            Some(_) => {}
            None => {
                bounds.devices.insert(device.to_string(), Interval::point(t));
            }
        }
        Ok(())
    }

    /// Widen the device's end bound to `t`
    pub fn update_end_time(&self, device: &str, t: Timestamp) -> Result<()> {
        self.ensure_unclosed()?;
        let mut bounds = self.bounds.write();
        match bounds.devices.get_mut(device) {
            Some(iv) if t > iv.end() => *iv = Interval::new(iv.start(), t),
            Some(_) => {}
            None => {
                bounds.devices.insert(device.to_string(), Interval::point(t));
            }
        }
        Ok(())
    }

    /// Widen both the series and its device to cover `interval`
    pub fn update_series(&self, series: &SeriesKey, interval: Interval) -> Result<()> {
        self.ensure_unclosed()?;
        let mut bounds = self.bounds.write();
        bounds
            .series
            .entry(series.clone())
            .and_modify(|iv| *iv = iv.span(&interval))
            .or_insert(interval);
        bounds
            .devices
            .entry(series.device.clone())
            .and_modify(|iv| *iv = iv.span(&interval))
            .or_insert(interval);
        Ok(())
    }

    pub fn set_file_size(&self, size: u64) -> Result<()> {
        self.ensure_unclosed()?;
        self.bounds.write().file_size = size;
        Ok(())
    }

    pub fn file_size(&self) -> u64 {
        self.bounds.read().file_size
    }

    pub fn start_time(&self, device: &str) -> Option<Timestamp> {
        self.device_interval(device).map(|iv| iv.start())
    }

    pub fn end_time(&self, device: &str) -> Option<Timestamp> {
        self.device_interval(device).map(|iv| iv.end())
    }

    pub fn device_interval(&self, device: &str) -> Option<Interval> {
        self.bounds.read().devices.get(device).copied()
    }

    pub fn series_interval(&self, series: &SeriesKey) -> Option<Interval> {
        self.bounds.read().series.get(series).copied()
    }

    /// Snapshot of per-device bounds, ordered by device
    pub fn devices(&self) -> Vec<(String, Interval)> {
        self.bounds
            .read()
            .devices
            .iter()
            .map(|(d, iv)| (d.clone(), *iv))
            .collect()
    }

    /// Snapshot of per-series bounds of one device
    pub fn series_of(&self, device: &str) -> Vec<(String, Interval)> {
        self.bounds
            .read()
            .series
            .iter()
            .filter(|(k, _)| k.device == device)
            .map(|(k, iv)| (k.measurement.clone(), *iv))
            .collect()
    }

    pub fn contains_device(&self, device: &str) -> bool {
        self.bounds.read().devices.contains_key(device)
    }

    pub(crate) fn bounds_snapshot(&self) -> Bounds {
        self.bounds.read().clone()
    }

    /// Move to `to`, validated against the lifecycle table
    pub fn set_status(&self, to: ResourceStatus) -> Result<()> {
        let mut state = self.state.lock();
        self.apply(&mut state, to)
    }

    /// Move from `from` to `to`; fails if the current status is not `from`
    pub fn transition(&self, from: ResourceStatus, to: ResourceStatus) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != from {
            return Err(FoldError::IllegalTransition {
                file: self.name.to_string(),
                from: state.status,
                to,
            });
        }
        self.apply(&mut state, to)
    }

    fn apply(&self, state: &mut Lifecycle, to: ResourceStatus) -> Result<()> {
        if !state.status.can_transition_to(to) {
            return Err(FoldError::IllegalTransition {
                file: self.name.to_string(),
                from: state.status,
                to,
            });
        }
        if to == ResourceStatus::Deleted && state.pins > 0 {
            return Err(FoldError::ResourcePinned {
                file: self.name.to_string(),
                pins: state.pins,
            });
        }
        state.status = to;
        Ok(())
    }

    /// CLOSED -> COMPACTION_CANDIDATE; the only way into a compaction
    pub fn claim(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != ResourceStatus::Closed {
            return Err(FoldError::AlreadyClaimed {
                file: self.name.to_string(),
                status: state.status,
            });
        }
        state.status = ResourceStatus::CompactionCandidate;
        Ok(())
    }

    /// COMPACTING -> DELETED if no reader holds a pin; `Ok(false)` otherwise
    pub fn try_retire(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.status != ResourceStatus::Compacting {
            return Err(FoldError::IllegalTransition {
                file: self.name.to_string(),
                from: state.status,
                to: ResourceStatus::Deleted,
            });
        }
        if state.pins > 0 {
            return Ok(false);
        }
        state.status = ResourceStatus::Deleted;
        Ok(true)
    }

    /// Register a reader; fails once the resource is deleted
    pub fn pin(self: &Arc<Self>) -> Result<PinGuard> {
        let mut state = self.state.lock();
        if state.status == ResourceStatus::Deleted {
            return Err(FoldError::ResourceDeleted(self.name.to_string()));
        }
        state.pins += 1;
        Ok(PinGuard {
            resource: Arc::clone(self),
        })
    }

    pub fn pin_count(&self) -> usize {
        self.state.lock().pins
    }

    /// Block until no reader holds a pin, or `timeout` elapses
    pub fn wait_unpinned(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.pins > 0 {
            if self.unpinned.wait_until(&mut state, deadline).timed_out() {
                return state.pins == 0;
            }
        }
        true
    }

    fn unpin(&self) {
        let mut state = self.state.lock();
        state.pins = state.pins.saturating_sub(1);
        if state.pins == 0 {
            self.unpinned.notify_all();
        }
    }

    /// Persist bounds and status to the sidecar
    pub fn serialize(&self) -> Result<()> {
        let sidecar = ResourceSidecar::capture(self.stream, self.status(), &self.bounds_snapshot());
        sidecar.write(&self.resource_path())
    }

    /// Restore a resource from the sidecar next to `data_path`
    pub fn deserialize(data_path: &Path) -> Result<Self> {
        let name = Self::name_from_path(data_path)?;
        let sidecar = ResourceSidecar::read(&Self::sidecar_path(data_path))?;
        let (stream, status, bounds) = sidecar.into_parts()?;
        Ok(Self::with_parts(
            name,
            data_path.to_path_buf(),
            stream,
            bounds,
            status,
        ))
    }

    /// Overwrite the status recorded in the sidecar, e.g. during recovery
    pub(crate) fn persist_status(&self, status: ResourceStatus) -> Result<()> {
        let sidecar = ResourceSidecar::capture(self.stream, status, &self.bounds_snapshot());
        sidecar.write(&self.resource_path())
    }

    /// Remove the data file and its sidecar
    pub fn remove_files(&self) -> Result<()> {
        crate::io::remove_if_exists(&self.path)?;
        crate::io::remove_if_exists(&self.resource_path())?;
        Ok(())
    }
}

impl fmt::Debug for FileResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileResource")
            .field("name", &self.name.to_string())
            .field("stream", &self.stream)
            .field("status", &self.status())
            .finish()
    }
}

/// Reader registration; released on drop
pub struct PinGuard {
    resource: Arc<FileResource>,
}

impl PinGuard {
    pub fn resource(&self) -> &Arc<FileResource> {
        &self.resource
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.resource.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn resource(dir: &Path, version: u64) -> Arc<FileResource> {
        let path = dir.join(FileName::new(1000, version).file_name());
        Arc::new(FileResource::new(path, StreamKind::Sequence).unwrap())
    }

    #[test]
    fn test_bounds_only_widen() {
        let dir = TempDir::new().unwrap();
        let res = resource(dir.path(), 1);

        res.update_start_time("d1", 50).unwrap();
        res.update_end_time("d1", 80).unwrap();
        res.update_start_time("d1", 60).unwrap();
        res.update_end_time("d1", 70).unwrap();
        assert_eq!(res.device_interval("d1"), Some(Interval::new(50, 80)));

        res.update_start_time("d1", 10).unwrap();
        res.update_end_time("d1", 90).unwrap();
        assert_eq!(res.start_time("d1"), Some(10));
        assert_eq!(res.end_time("d1"), Some(90));
    }

    #[test]
    fn test_bounds_frozen_after_close() {
        let dir = TempDir::new().unwrap();
        let res = resource(dir.path(), 1);
        res.update_series(&SeriesKey::new("d1", "s0"), Interval::new(0, 9))
            .unwrap();
        res.set_status(ResourceStatus::Closed).unwrap();

        let err = res.update_end_time("d1", 100).unwrap_err();
        assert!(matches!(err, FoldError::ResourceSealed(_)));
        assert_eq!(res.end_time("d1"), Some(9));
    }

    #[test]
    fn test_illegal_transition_is_reported() {
        let dir = TempDir::new().unwrap();
        let res = resource(dir.path(), 7);
        let err = res.set_status(ResourceStatus::Compacting).unwrap_err();
        match err {
            FoldError::IllegalTransition { file, from, to } => {
                assert_eq!(file, "1000-7-0-0");
                assert_eq!(from, ResourceStatus::Unclosed);
                assert_eq!(to, ResourceStatus::Compacting);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_claim_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let res = resource(dir.path(), 1);
        res.set_status(ResourceStatus::Closed).unwrap();

        res.claim().unwrap();
        let err = res.claim().unwrap_err();
        assert!(matches!(err, FoldError::AlreadyClaimed { .. }));
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let dir = TempDir::new().unwrap();
        let res = resource(dir.path(), 1);
        res.set_status(ResourceStatus::Closed).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let res = Arc::clone(&res);
                thread::spawn(move || res.claim().is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_pins_block_deletion() {
        let dir = TempDir::new().unwrap();
        let res = resource(dir.path(), 1);
        res.set_status(ResourceStatus::Closed).unwrap();
        res.claim().unwrap();
        res.set_status(ResourceStatus::Compacting).unwrap();

        let guard = res.pin().unwrap();
        assert_eq!(res.pin_count(), 1);
        assert!(!res.try_retire().unwrap());
        assert!(matches!(
            res.set_status(ResourceStatus::Deleted),
            Err(FoldError::ResourcePinned { pins: 1, .. })
        ));
        assert!(!res.wait_unpinned(Duration::from_millis(10)));

        let waiter = {
            let res = Arc::clone(&res);
            thread::spawn(move || res.wait_unpinned(Duration::from_secs(5)))
        };
        drop(guard);
        assert!(waiter.join().unwrap());

        assert!(res.try_retire().unwrap());
        assert_eq!(res.status(), ResourceStatus::Deleted);
        assert!(matches!(res.pin(), Err(FoldError::ResourceDeleted(_))));
    }

    #[test]
    fn test_sidecar_restores_bounds_and_status() {
        let dir = TempDir::new().unwrap();
        let res = resource(dir.path(), 3);
        res.update_series(&SeriesKey::new("d1", "s0"), Interval::new(0, 99))
            .unwrap();
        res.update_series(&SeriesKey::new("d1", "s1"), Interval::new(10, 120))
            .unwrap();
        res.update_series(&SeriesKey::new("d2", "s0"), Interval::new(-5, 5))
            .unwrap();
        res.set_file_size(4096).unwrap();
        res.set_status(ResourceStatus::Closed).unwrap();
        res.serialize().unwrap();

        let restored = FileResource::deserialize(res.path()).unwrap();
        assert_eq!(restored.name(), res.name());
        assert_eq!(restored.status(), ResourceStatus::Closed);
        assert_eq!(restored.stream(), StreamKind::Sequence);
        assert_eq!(restored.file_size(), 4096);
        assert_eq!(restored.device_interval("d1"), Some(Interval::new(0, 120)));
        assert_eq!(restored.device_interval("d2"), Some(Interval::new(-5, 5)));
        assert_eq!(
            restored.series_interval(&SeriesKey::new("d1", "s1")),
            Some(Interval::new(10, 120))
        );
    }
}
