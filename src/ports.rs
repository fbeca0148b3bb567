//! Source-port leasing across client processes
//!
//! Independent client processes on one host share a source IP and must
//! not bind the same UDP port. The registry is a flat comma-separated
//! list of leased port numbers in a shared file; every read-modify-write
//! of that list happens under an exclusive advisory lock. This is the
//! only cross-process concurrency-control point in the crate.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// Exclusive port leasing. At most one live holder per port number
/// within the configured range at any time.
pub trait LeaseService: Send + Sync {
    /// Lease the first free port in `range`, ascending. Leaves no
    /// partial lease behind on failure.
    fn acquire(&self, range: RangeInclusive<u16>) -> Result<u16>;

    /// Return a leased port to the pool.
    fn release(&self, port: u16) -> Result<()>;
}

/// File-backed registry shared between OS processes.
pub struct FileRegistry {
    path: PathBuf,
    /// When false the registry file is deleted once the leased set
    /// becomes empty on release.
    persistent: bool,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>, persistent: bool) -> Self {
        Self {
            path: path.into(),
            persistent,
        }
    }

    fn lock(&self, create: bool) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&self.path)
            .map_err(|e| {
                Error::Resource(format!(
                    "failed to open port registry {}: {e}",
                    self.path.display()
                ))
            })?;

        file.lock_exclusive()
            .map_err(|e| Error::Resource(format!("failed to lock port registry: {e}")))?;

        Ok(file)
    }

    fn read_ports(file: &mut File) -> Result<BTreeSet<u16>> {
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| Error::Resource(format!("failed to read port registry: {e}")))?;

        Ok(contents
            .split(',')
            .filter_map(|p| p.trim().parse().ok())
            .collect())
    }

    fn write_ports(file: &mut File, ports: &BTreeSet<u16>) -> Result<()> {
        let joined = ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");

        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(joined.as_bytes()))
            .map_err(|e| Error::Resource(format!("failed to write port registry: {e}")))
    }
}

impl LeaseService for FileRegistry {
    fn acquire(&self, range: RangeInclusive<u16>) -> Result<u16> {
        if range.is_empty() {
            return Err(Error::Resource(format!(
                "invalid port range {}..={}",
                range.start(),
                range.end()
            )));
        }

        let mut file = self.lock(true)?;
        let result = (|| {
            let mut ports = Self::read_ports(&mut file)?;
            let port = range
                .clone()
                .find(|p| !ports.contains(p))
                .ok_or_else(|| {
                    Error::Resource(format!(
                        "no ports left to lease in {}..={}",
                        range.start(),
                        range.end()
                    ))
                })?;
            ports.insert(port);
            Self::write_ports(&mut file, &ports)?;
            Ok(port)
        })();
        let _ = FileExt::unlock(&file);

        if let Ok(port) = &result {
            debug!("Leased source port {} from {}", port, self.path.display());
        }
        result
    }

    fn release(&self, port: u16) -> Result<()> {
        let mut file = self.lock(false)?;
        let result = (|| {
            let mut ports = Self::read_ports(&mut file)?;
            ports.remove(&port);

            if ports.is_empty() && !self.persistent {
                return Ok(true);
            }
            Self::write_ports(&mut file, &ports)?;
            Ok(false)
        })();
        let _ = FileExt::unlock(&file);
        drop(file);

        match result {
            Ok(true) => {
                std::fs::remove_file(&self.path).map_err(|e| {
                    Error::Resource(format!("failed to remove empty port registry: {e}"))
                })?;
                debug!("Released port {} and removed empty registry", port);
                Ok(())
            }
            Ok(false) => {
                debug!("Released source port {}", port);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// In-memory registry honoring the same contract, for tests and
/// single-process embedding.
#[derive(Default)]
pub struct MemoryRegistry {
    leased: Mutex<BTreeSet<u16>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseService for MemoryRegistry {
    fn acquire(&self, range: RangeInclusive<u16>) -> Result<u16> {
        if range.is_empty() {
            return Err(Error::Resource(format!(
                "invalid port range {}..={}",
                range.start(),
                range.end()
            )));
        }

        let mut leased = self
            .leased
            .lock()
            .map_err(|_| Error::Resource("port registry lock poisoned".to_string()))?;
        let port = range
            .clone()
            .find(|p| !leased.contains(p))
            .ok_or_else(|| {
                Error::Resource(format!(
                    "no ports left to lease in {}..={}",
                    range.start(),
                    range.end()
                ))
            })?;
        leased.insert(port);
        Ok(port)
    }

    fn release(&self, port: u16) -> Result<()> {
        let mut leased = self
            .leased
            .lock()
            .map_err(|_| Error::Resource("port registry lock poisoned".to_string()))?;
        leased.remove(&port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_registry(persistent: bool) -> (FileRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("ports"), persistent);
        (registry, dir)
    }

    #[test]
    fn test_acquire_distinct_ascending() {
        let (registry, _dir) = file_registry(true);
        let a = registry.acquire(5065..=5070).unwrap();
        let b = registry.acquire(5065..=5070).unwrap();
        let c = registry.acquire(5065..=5070).unwrap();
        assert_eq!((a, b, c), (5065, 5066, 5067));
    }

    #[test]
    fn test_exhausted_range() {
        let (registry, _dir) = file_registry(true);
        for _ in 0..3 {
            registry.acquire(6000..=6002).unwrap();
        }
        let err = registry.acquire(6000..=6002).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn test_release_makes_port_available_again() {
        let (registry, _dir) = file_registry(true);
        let a = registry.acquire(5065..=5066).unwrap();
        let _b = registry.acquire(5065..=5066).unwrap();
        registry.release(a).unwrap();
        assert_eq!(registry.acquire(5065..=5066).unwrap(), a);
    }

    #[test]
    fn test_invalid_range() {
        let (registry, _dir) = file_registry(true);
        #[allow(clippy::reversed_empty_ranges)]
        let err = registry.acquire(5265..=5065).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn test_non_persistent_registry_removed_when_empty() {
        let (registry, _dir) = file_registry(false);
        let a = registry.acquire(5065..=5066).unwrap();
        let b = registry.acquire(5065..=5066).unwrap();
        registry.release(a).unwrap();
        assert!(registry.path.exists());
        registry.release(b).unwrap();
        assert!(!registry.path.exists());
    }

    #[test]
    fn test_persistent_registry_kept_when_empty() {
        let (registry, _dir) = file_registry(true);
        let a = registry.acquire(5065..=5066).unwrap();
        registry.release(a).unwrap();
        assert!(registry.path.exists());
        assert_eq!(std::fs::read_to_string(&registry.path).unwrap(), "");
    }

    #[test]
    fn test_two_registries_share_one_file() {
        // Two handles on the same path model two independent processes.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports");
        let one = FileRegistry::new(&path, true);
        let two = FileRegistry::new(&path, true);

        let a = one.acquire(5065..=5070).unwrap();
        let b = two.acquire(5065..=5070).unwrap();
        assert_ne!(a, b);

        one.release(a).unwrap();
        assert_eq!(two.acquire(5065..=5070).unwrap(), a);
    }

    #[test]
    fn test_memory_registry_contract() {
        let registry = MemoryRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let port = registry.acquire(5065..=5069).unwrap();
            assert!((5065..=5069).contains(&port));
            assert!(seen.insert(port));
        }
        assert!(matches!(
            registry.acquire(5065..=5069),
            Err(Error::Resource(_))
        ));
        registry.release(5067).unwrap();
        assert_eq!(registry.acquire(5065..=5069).unwrap(), 5067);
    }
}
