//! Fault injection for exercising retry paths
//!
//! A [`FaultInjector`] is consulted before every attempt of a remote call.
//! Production clients use [`NoFaults`]; tests pass a [`FailFirst`] to make
//! selected calls fail a fixed number of times.

use crate::{ClientError, Result};
use dashmap::DashMap;
use std::fmt;

/// Remote calls that can be made to fail
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Initiating a multipart upload or copy
    Initiate,
    /// Uploading one part
    UploadPart,
    /// Fetching one part's byte range
    DownloadPart,
    /// Copying one part server-side
    CopyPart,
    /// Completing a multipart upload or copy
    Complete,
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initiate => "initiate",
            Self::UploadPart => "upload-part",
            Self::DownloadPart => "download-part",
            Self::CopyPart => "copy-part",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Decides whether an attempt should fail before reaching the transport
pub trait FaultInjector: Send + Sync {
    /// `id` identifies the operation, e.g. `bucket/key#3` for part 3
    fn before(&self, point: FaultPoint, id: &str) -> Result<()>;
}

/// Injects nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn before(&self, _point: FaultPoint, _id: &str) -> Result<()> {
        Ok(())
    }
}

/// Fails the first `times` attempts of every operation at one point
#[derive(Debug)]
pub struct FailFirst {
    point: FaultPoint,
    times: usize,
    attempts: DashMap<String, usize>,
}

impl FailFirst {
    /// Fail each distinct operation at `point` `times` times
    pub fn new(point: FaultPoint, times: usize) -> Self {
        Self {
            point,
            times,
            attempts: DashMap::new(),
        }
    }

    /// Total faults injected so far
    pub fn injected(&self) -> usize {
        self.attempts
            .iter()
            .map(|entry| (*entry.value()).min(self.times))
            .sum()
    }
}

impl FaultInjector for FailFirst {
    fn before(&self, point: FaultPoint, id: &str) -> Result<()> {
        if point != self.point {
            return Ok(());
        }
        let mut attempts = self.attempts.entry(id.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts <= self.times {
            return Err(ClientError::InjectedFault(format!(
                "{} {} (attempt {})",
                point, id, *attempts
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_first_counts_per_id() {
        let faults = FailFirst::new(FaultPoint::UploadPart, 2);
        assert!(faults.before(FaultPoint::UploadPart, "b/k#1").is_err());
        assert!(faults.before(FaultPoint::UploadPart, "b/k#1").is_err());
        assert!(faults.before(FaultPoint::UploadPart, "b/k#1").is_ok());
        assert!(faults.before(FaultPoint::UploadPart, "b/k#2").is_err());
        assert!(faults.before(FaultPoint::Complete, "b/k").is_ok());
        assert_eq!(faults.injected(), 3);
    }

    #[test]
    fn test_no_faults() {
        assert!(NoFaults.before(FaultPoint::Initiate, "x").is_ok());
    }
}
