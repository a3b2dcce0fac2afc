//! On-disk pipeline cache.
//!
//! [`PipelineCacheStore`] persists the driver's compiled-pipeline blob
//! across process runs, keyed by device identity so a cache written by one
//! GPU/driver combination is never fed to another. Persistence is strictly
//! best-effort: a missing, unreadable, or corrupt file falls back to an
//! empty cache, and save failures are logged and swallowed. A lost cache
//! costs startup time, not correctness.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::device::Device;

/// Identity of the device a cache blob belongs to.
///
/// Combines vendor, device, driver (id when reported, version otherwise),
/// API version, and the pipeline-cache UUID the driver stamps into its
/// properties.
#[derive(Clone, Copy, Debug)]
pub struct CacheKey {
    pub vendor_id: u32,
    pub device_id: u32,
    /// Nonzero when the driver reports `VkPhysicalDeviceDriverProperties`.
    pub driver_id: u32,
    pub driver_version: u32,
    pub api_version: u32,
    pub cache_uuid: [u8; vk::UUID_SIZE],
}

impl CacheKey {
    /// Reads the identity of `physical_device`.
    pub fn from_physical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        // driverID is core 1.2; older drivers leave the struct untouched.
        let mut driver_properties = vk::PhysicalDeviceDriverProperties::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut driver_properties);
        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut properties2);
        }

        Self {
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            driver_id: driver_properties.driver_id.as_raw() as u32,
            driver_version: properties.driver_version,
            api_version: properties.api_version,
            cache_uuid: properties.pipeline_cache_uuid,
        }
    }

    /// Stable cache file name for this identity.
    ///
    /// Prefers the driver id when available and falls back to the raw
    /// driver version, so the two never collide.
    pub fn file_name(&self) -> String {
        let major = vk::api_version_major(self.api_version);
        let minor = vk::api_version_minor(self.api_version);
        let uuid = hex(&self.cache_uuid);

        if self.driver_id != 0 {
            format!(
                "pso_{:04x}_{:04x}_drv_{:04x}_api_{}.{}_uuid_{}.bin",
                self.vendor_id, self.device_id, self.driver_id, major, minor, uuid
            )
        } else {
            format!(
                "pso_{:04x}_{:04x}_drvver_{:08x}_api_{}.{}_uuid_{}.bin",
                self.vendor_id, self.device_id, self.driver_version, major, minor, uuid
            )
        }
    }
}

/// Lowercase hex rendering of raw bytes.
fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, byte| {
            let _ = write!(out, "{:02x}", byte);
            out
        },
    )
}

/// Writes `data` to `path` via a temporary file and an atomic rename, so a
/// crash mid-write never leaves a truncated cache behind.
fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path).or_else(|_| {
        // Some platforms refuse to rename over an existing file.
        let _ = std::fs::remove_file(path);
        std::fs::rename(&tmp, path)
    })
}

/// Loads the persisted blob, treating every failure as "no cache".
fn load_blob(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap_or_default()
}

/// Pipeline cache object with durable on-disk backing.
pub struct PipelineCacheStore {
    device: Arc<Device>,
    cache: vk::PipelineCache,
    path: PathBuf,
}

impl PipelineCacheStore {
    /// Creates the cache object, seeded with the blob previously saved for
    /// `key` under `directory` when one exists.
    ///
    /// Never fails: a corrupt blob is discarded (the driver validates its
    /// own header and we retry with an empty cache), and if even that
    /// creation fails the store carries a null handle and every later
    /// operation becomes a no-op.
    pub fn new(device: Arc<Device>, key: &CacheKey, directory: &Path) -> Self {
        let _ = std::fs::create_dir_all(directory);
        let path = directory.join(key.file_name());

        let initial_data = load_blob(&path);
        if !initial_data.is_empty() {
            debug!(
                "Seeding pipeline cache from {} ({} bytes)",
                path.display(),
                initial_data.len()
            );
        }

        let seeded = vk::PipelineCacheCreateInfo::default().initial_data(&initial_data);
        let cache = unsafe { device.handle().create_pipeline_cache(&seeded, None) }
            .or_else(|_| {
                warn!("Persisted pipeline cache rejected by driver, starting empty");
                let empty = vk::PipelineCacheCreateInfo::default();
                unsafe { device.handle().create_pipeline_cache(&empty, None) }
            })
            .unwrap_or_else(|e| {
                warn!("Pipeline cache unavailable: {:?}", e);
                vk::PipelineCache::null()
            });

        Self {
            device,
            cache,
            path,
        }
    }

    /// Handle to pass to pipeline creation; may be null when the cache
    /// could not be created.
    #[inline]
    pub fn handle(&self) -> vk::PipelineCache {
        self.cache
    }

    /// Path the blob is persisted at.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes the current cache contents to disk.
    ///
    /// Best-effort: failures are logged and ignored.
    pub fn save(&self) {
        if self.cache == vk::PipelineCache::null() {
            return;
        }

        let data = match unsafe { self.device.handle().get_pipeline_cache_data(self.cache) } {
            Ok(data) if !data.is_empty() => data,
            Ok(_) => return,
            Err(e) => {
                debug!("Failed to fetch pipeline cache data: {:?}", e);
                return;
            }
        };

        match write_atomically(&self.path, &data) {
            Ok(()) => info!(
                "Saved pipeline cache: {} bytes to {}",
                data.len(),
                self.path.display()
            ),
            Err(e) => debug!("Failed to persist pipeline cache: {}", e),
        }
    }
}

impl Drop for PipelineCacheStore {
    fn drop(&mut self) {
        self.save();
        if self.cache != vk::PipelineCache::null() {
            unsafe {
                self.device.handle().destroy_pipeline_cache(self.cache, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> CacheKey {
        CacheKey {
            vendor_id: 0x10de,
            device_id: 0x2684,
            driver_id: 4,
            driver_version: 0x0201_0000,
            api_version: vk::make_api_version(0, 1, 3, 260),
            cache_uuid: [
                0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc,
                0xdd, 0xee, 0xff,
            ],
        }
    }

    #[test]
    fn test_hex_rendering() {
        assert_eq!(hex(&[0x00, 0x0f, 0xf0, 0xff]), "000ff0ff");
        assert_eq!(hex(&[]), "");
    }

    #[test]
    fn test_file_name_with_driver_id() {
        let key = sample_key();
        assert_eq!(
            key.file_name(),
            "pso_10de_2684_drv_0004_api_1.3_uuid_00112233445566778899aabbccddeeff.bin"
        );
    }

    #[test]
    fn test_file_name_falls_back_to_driver_version() {
        let key = CacheKey {
            driver_id: 0,
            ..sample_key()
        };
        assert_eq!(
            key.file_name(),
            "pso_10de_2684_drvver_02010000_api_1.3_uuid_00112233445566778899aabbccddeeff.bin"
        );
    }

    #[test]
    fn test_distinct_devices_use_distinct_files() {
        let a = sample_key();
        let b = CacheKey {
            device_id: 0x1234,
            ..a
        };
        assert_ne!(a.file_name(), b.file_name());
    }

    #[test]
    fn test_load_blob_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_blob(&dir.path().join("absent.bin")).is_empty());
    }

    #[test]
    fn test_write_atomically_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(sample_key().file_name());

        write_atomically(&path, b"first blob").unwrap();
        assert_eq!(load_blob(&path), b"first blob");

        // Overwriting an existing cache must also succeed.
        write_atomically(&path, b"second blob").unwrap();
        assert_eq!(load_blob(&path), b"second blob");

        // No temp file is left behind.
        let residue: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(residue.is_empty());
    }

    #[test]
    fn test_save_then_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let key = sample_key();
        let path = dir.path().join(key.file_name());

        let blob = vec![7u8; 4096];
        write_atomically(&path, &blob).unwrap();

        // A second process with the same identity and directory sees the
        // same bytes.
        assert_eq!(load_blob(&dir.path().join(key.file_name())), blob);
    }
}
