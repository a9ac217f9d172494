//! Buffered writer of one UNCLOSED file

use super::StoragePartition;
use crate::interval::Interval;
use crate::resource::{FileResource, ResourceStatus, StreamKind};
use crate::tsfile::TsFileWriter;
use crate::{FoldError, Result, SeriesKey, TimeValuePair, Timestamp, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Collects points for one file and seals it on [`close`](Self::close).
///
/// Points are buffered in series and time order; a later write to the same
/// timestamp replaces the earlier one. A sequence file reaches the partition's
/// statistics only once it is sealed.
pub struct FileAppender<'p> {
    partition: &'p StoragePartition,
    resource: Arc<FileResource>,
    buffer: BTreeMap<SeriesKey, BTreeMap<Timestamp, Value>>,
}

impl<'p> FileAppender<'p> {
    pub(super) fn new(partition: &'p StoragePartition, resource: Arc<FileResource>) -> Self {
        Self {
            partition,
            resource,
            buffer: BTreeMap::new(),
        }
    }

    pub fn resource(&self) -> &Arc<FileResource> {
        &self.resource
    }

    pub fn point_count(&self) -> usize {
        self.buffer.values().map(BTreeMap::len).sum()
    }

    /// Buffer one point and widen the file's bounds
    pub fn write(&mut self, series: &SeriesKey, point: TimeValuePair) -> Result<()> {
        self.resource
            .update_series(series, Interval::point(point.timestamp))?;
        self.buffer
            .entry(series.clone())
            .or_default()
            .insert(point.timestamp, point.value);
        Ok(())
    }

    /// Write the data file, persist the sidecar and mark the file CLOSED
    pub fn close(self) -> Result<Arc<FileResource>> {
        let mut sealed = Self::close_all(vec![self])?;
        sealed.pop().ok_or_else(|| FoldError::Internal("appender sealed nothing".into()))
    }

    /// Seal several files as one unit: every data file is written before any
    /// of them turns CLOSED. On error all of them are aborted.
    pub fn close_all(appenders: Vec<Self>) -> Result<Vec<Arc<FileResource>>> {
        if let Some((name, e)) = appenders
            .iter()
            .find_map(|a| a.write_data().err().map(|e| (a.resource.name(), e)))
        {
            warn!("Failed to write {}: {}", name, e);
            Self::abort_all(appenders);
            return Err(e);
        }

        let mut sealed: Vec<Self> = Vec::with_capacity(appenders.len());
        let mut pending = appenders.into_iter();
        while let Some(appender) = pending.next() {
            if let Err(e) = appender.publish() {
                warn!("Failed to seal {}: {}", appender.resource.name(), e);
                appender.abort();
                Self::abort_all(pending.collect());
                for published in sealed {
                    published.withdraw();
                }
                return Err(e);
            }
            sealed.push(appender);
        }

        Ok(sealed.into_iter().map(|appender| appender.finish()).collect())
    }

    /// Hand out a published file, recording sequence data
    fn finish(self) -> Arc<FileResource> {
        if self.resource.stream() == StreamKind::Sequence {
            self.partition.record_sequence_file(&self.resource);
        }
        debug!(
            "Sealed {} file {} ({} bytes)",
            self.resource.stream().dir_name(),
            self.resource.name(),
            self.resource.file_size()
        );
        self.resource
    }

    /// Take back a published file of a failed batch. A file some compaction
    /// or reader got hold of meanwhile stays.
    fn withdraw(self) {
        if self.resource.pin_count() == 0 && self.resource.claim().is_ok() {
            self.abort();
        } else {
            self.finish();
        }
    }

    fn abort_all(appenders: Vec<Self>) {
        for appender in appenders {
            appender.abort();
        }
    }

    /// Write the data file; the resource stays UNCLOSED
    fn write_data(&self) -> Result<()> {
        let partition = self.partition;
        let mut writer = TsFileWriter::create(
            self.resource.path(),
            partition.codec(),
            partition.config.chunk,
        )?
        .with_retry_attempts(partition.config.compaction.io_retry_attempts);

        for (series, points) in &self.buffer {
            for (timestamp, value) in points {
                writer.write_point(series, TimeValuePair::new(*timestamp, value.clone()))?;
            }
        }
        let summary = writer.finish()?;
        self.resource.set_file_size(summary.file_size)
    }

    /// UNCLOSED -> CLOSED plus the sidecar
    fn publish(&self) -> Result<()> {
        self.resource.set_status(ResourceStatus::Closed)?;
        self.resource.serialize()
    }

    /// Unregister the file and delete whatever reached the disk
    pub fn abort(self) {
        self.partition.registry.remove(&self.resource);
        if let Err(e) = self.resource.remove_files() {
            warn!(
                "Failed to remove aborted file {:?}: {}",
                self.resource.path(),
                e
            );
        }
    }
}
