//! NVS-backed region storage adapter.
//!
//! Implements [`RegionStorage`] with one NVS blob per named region.
//!
//! # Security
//!
//! - Region sizes are fixed at first open; a later open with a different
//!   size reports [`StorageError::SizeMismatch`] instead of truncating.
//! - Atomic writes: ESP-IDF NVS commits are atomic per `nvs_commit()`, so a
//!   region is either fully old or fully new after power loss.
//! - The simulation backend keeps blobs in memory (dev/test only).

use log::{debug, info};

use crate::app::ports::{RegionHandle, RegionStorage, StorageError, UpdateRate};

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

#[cfg(target_os = "espidf")]
use log::warn;

#[cfg(target_os = "espidf")]
const NAMESPACE: &str = "meterlink";

/// NVS limits keys to 15 bytes plus terminator.
const MAX_KEY_LEN: usize = 15;

pub struct RegionStore {
    /// Opened regions, indexed by [`RegionHandle`].
    names: Vec<(&'static str, usize)>,
    #[cfg(not(target_os = "espidf"))]
    blobs: HashMap<&'static str, Vec<u8>>,
}

impl Default for RegionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionStore {
    /// Create the store. On target, NVS flash must already be initialised
    /// by the firmware's boot path.
    pub fn new() -> Self {
        #[cfg(not(target_os = "espidf"))]
        info!("RegionStore: simulation backend");

        #[cfg(target_os = "espidf")]
        info!("RegionStore: ESP-IDF NVS namespace '{NAMESPACE}'");

        Self {
            names: Vec::new(),
            #[cfg(not(target_os = "espidf"))]
            blobs: HashMap::new(),
        }
    }

    /// Raw region contents (simulation only).
    #[cfg(not(target_os = "espidf"))]
    pub fn contents(&self, name: &str) -> Option<&[u8]> {
        self.blobs.get(name).map(Vec::as_slice)
    }

    /// Install a region with the given contents, as an older firmware would
    /// have left it (simulation only).
    #[cfg(not(target_os = "espidf"))]
    pub fn preload(&mut self, name: &'static str, bytes: Vec<u8>) {
        self.blobs.insert(name, bytes);
    }

    fn region(&self, handle: RegionHandle) -> Result<(&'static str, usize), StorageError> {
        self.names
            .get(handle.0 as usize)
            .copied()
            .ok_or(StorageError::NotFound)
    }

    fn register(&mut self, name: &'static str, size: usize) -> RegionHandle {
        if let Some(idx) = self.names.iter().position(|(n, _)| *n == name) {
            self.names[idx].1 = size;
            return RegionHandle(idx as u16);
        }
        self.names.push((name, size));
        RegionHandle((self.names.len() - 1) as u16)
    }

    /// Open an NVS namespace, execute a closure with the handle, then close.
    #[cfg(target_os = "espidf")]
    fn with_nvs_handle<F, T>(write: bool, f: F) -> Result<T, i32>
    where
        F: FnOnce(nvs_handle_t) -> Result<T, i32>,
    {
        let ns = key_buf(NAMESPACE);
        let mut handle: nvs_handle_t = 0;
        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };

        // SAFETY: `ns` is a NUL-terminated buffer that outlives the call.
        let ret = unsafe { nvs_open(ns.as_ptr() as *const _, mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }

        let result = f(handle);
        // SAFETY: `handle` was opened above and is closed exactly once.
        unsafe {
            nvs_close(handle);
        }
        result
    }

    #[cfg(target_os = "espidf")]
    fn load_blob(name: &str, size: usize) -> Result<Option<Vec<u8>>, i32> {
        let result = Self::with_nvs_handle(false, |handle| {
            let key = key_buf(name);
            let mut stored: usize = 0;
            // SAFETY: a null buffer asks NVS for the stored length only.
            let ret = unsafe {
                nvs_get_blob(handle, key.as_ptr() as *const _, core::ptr::null_mut(), &mut stored)
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            if stored != size {
                return Ok(Some(Vec::new()));
            }
            let mut buf = vec![0u8; stored];
            // SAFETY: `buf` holds exactly `stored` bytes.
            let ret = unsafe {
                nvs_get_blob(handle, key.as_ptr() as *const _, buf.as_mut_ptr() as *mut _, &mut stored)
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            Ok(Some(buf))
        });
        match result {
            Err(e) if e == ESP_ERR_NVS_NOT_FOUND => Ok(None),
            other => other,
        }
    }

    #[cfg(target_os = "espidf")]
    fn store_blob(name: &str, data: &[u8]) -> Result<(), StorageError> {
        let result = Self::with_nvs_handle(true, |handle| {
            let key = key_buf(name);
            // SAFETY: `key` is NUL-terminated; `data` is valid for its length.
            let ret = unsafe {
                nvs_set_blob(handle, key.as_ptr() as *const _, data.as_ptr() as *const _, data.len())
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            // SAFETY: handle is open for writing.
            let ret = unsafe { nvs_commit(handle) };
            if ret != ESP_OK {
                return Err(ret);
            }
            Ok(())
        });
        result.map_err(|e| {
            warn!("RegionStore: write '{name}' failed: {e}");
            if e == ESP_ERR_NVS_NOT_ENOUGH_SPACE {
                StorageError::Full
            } else {
                StorageError::IoError
            }
        })
    }
}

#[cfg(target_os = "espidf")]
fn key_buf(name: &str) -> [u8; MAX_KEY_LEN + 1] {
    let mut buf = [0u8; MAX_KEY_LEN + 1];
    let bytes = name.as_bytes();
    let len = bytes.len().min(MAX_KEY_LEN);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

fn check_bounds(size: usize, offset: usize, len: usize) -> Result<(), StorageError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(StorageError::OutOfBounds),
    }
}

impl RegionStorage for RegionStore {
    fn open(
        &mut self,
        name: &'static str,
        size: usize,
        rate: UpdateRate,
    ) -> Result<RegionHandle, StorageError> {
        if name.len() > MAX_KEY_LEN {
            return Err(StorageError::NotFound);
        }

        #[cfg(not(target_os = "espidf"))]
        {
            match self.blobs.get(name) {
                Some(existing) if existing.len() != size => return Err(StorageError::SizeMismatch),
                Some(_) => {}
                None => {
                    self.blobs.insert(name, vec![0u8; size]);
                }
            }
        }

        #[cfg(target_os = "espidf")]
        {
            match Self::load_blob(name, size) {
                Ok(Some(buf)) if buf.len() != size => return Err(StorageError::SizeMismatch),
                Ok(Some(_)) => {}
                Ok(None) => Self::store_blob(name, &vec![0u8; size])?,
                Err(e) => {
                    warn!("RegionStore: open '{name}' failed: {e}");
                    return Err(StorageError::IoError);
                }
            }
        }

        debug!("RegionStore: opened '{name}' ({size} bytes, {rate:?})");
        Ok(self.register(name, size))
    }

    fn read(
        &mut self,
        region: RegionHandle,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let (name, size) = self.region(region)?;
        check_bounds(size, offset, buf.len())?;

        #[cfg(not(target_os = "espidf"))]
        {
            let blob = self.blobs.get(name).ok_or(StorageError::NotFound)?;
            buf.copy_from_slice(&blob[offset..offset + buf.len()]);
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let blob = Self::load_blob(name, size)
                .map_err(|_| StorageError::IoError)?
                .ok_or(StorageError::NotFound)?;
            if blob.len() != size {
                return Err(StorageError::SizeMismatch);
            }
            buf.copy_from_slice(&blob[offset..offset + buf.len()]);
            Ok(())
        }
    }

    fn write(&mut self, region: RegionHandle, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        let (name, size) = self.region(region)?;
        check_bounds(size, offset, data.len())?;

        #[cfg(not(target_os = "espidf"))]
        {
            let blob = self.blobs.get_mut(name).ok_or(StorageError::NotFound)?;
            blob[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let mut blob = Self::load_blob(name, size)
                .map_err(|_| StorageError::IoError)?
                .filter(|b| b.len() == size)
                .unwrap_or_else(|| vec![0u8; size]);
            blob[offset..offset + data.len()].copy_from_slice(data);
            Self::store_blob(name, &blob)
        }
    }

    fn erase(&mut self, name: &'static str) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.blobs.remove(name);
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(true, |handle| {
                let key = key_buf(name);
                // SAFETY: `key` is NUL-terminated.
                let ret = unsafe { nvs_erase_key(handle, key.as_ptr() as *const _) };
                if ret != ESP_OK && ret != ESP_ERR_NVS_NOT_FOUND {
                    return Err(ret);
                }
                // SAFETY: handle is open for writing.
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            result.map_err(|_| StorageError::IoError)?;
        }

        info!("RegionStore: erased '{name}'");
        Ok(())
    }
}
