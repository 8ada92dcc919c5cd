//! Cached HTTP response bodies.
//!
//! Each Asset slot holds one immutable AssetGeneration.  Updating a
//! slot means building a complete new generation outside of any lock
//! and then swapping the slot's pointer to it, so a reader always sees
//! one whole generation.  Readers keep their own reference while they
//! write to the socket, and the superseded generation is freed when
//! the last of those references goes away, never under the lock.
use crate::now;
use crate::result::{TurfError, TurfResult};
use flate2::{Compression, GzBuilder};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

pub const HTML_TYPE: &str = "text/html; charset=utf-8";
pub const ICON_TYPE: &str = "image/vnd.microsoft.icon";
pub const JSON_TYPE: &str = "application/json";

pub const STATIC_CACHE: &str = "max-age=3600, must-revalidate";
pub const SCORE_CACHE: &str = "max-age=60, must-revalidate";
pub const RECENT_CACHE: &str = "max-age=0, must-revalidate";

/// gzip OS header byte for Unix.
const GZIP_OS_UNIX: u8 = 3;

/// Compress the content as a complete gzip member: fixed 10 byte
/// header with no timestamp or name, deflate body, CRC32 and length.
pub fn gzip(data: &[u8]) -> TurfResult<Vec<u8>> {
    let mut encoder = GzBuilder::new()
        .operating_system(GZIP_OS_UNIX)
        .write(Vec::with_capacity(data.len() / 2 + 64), Compression::default());

    encoder
        .write_all(data)
        .map_err(|e| TurfError::Asset(format!("gzip failed: {e}")))?;

    encoder
        .finish()
        .map_err(|e| TurfError::Asset(format!("gzip failed: {e}")))
}

/// One fully built version of an asset.
#[derive(Debug)]
pub struct AssetGeneration {
    data: Vec<u8>,
    gzip: Vec<u8>,
    content_type: String,
    cache_control: String,
    last_modified: String,
    mtime: SystemTime,
}

impl AssetGeneration {
    /// Build a generation, compressing the content up front so
    /// serving the gzip variant is a plain write of cached bytes.
    pub fn new(
        data: Vec<u8>,
        content_type: &str,
        cache_control: &str,
        mtime: SystemTime,
    ) -> TurfResult<AssetGeneration> {
        let gzip = gzip(&data)?;

        Ok(AssetGeneration {
            data,
            gzip,
            content_type: content_type.to_string(),
            cache_control: cache_control.to_string(),
            last_modified: now::http_date_from_system(mtime),
            mtime,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn gzip(&self) -> &[u8] {
        &self.gzip
    }
    /// Content to send, compressed or not.
    pub fn body(&self, compressed: bool) -> &[u8] {
        if compressed {
            &self.gzip
        } else {
            &self.data
        }
    }
    pub fn content_type(&self) -> &str {
        &self.content_type
    }
    pub fn cache_control(&self) -> &str {
        &self.cache_control
    }
    pub fn last_modified(&self) -> &str {
        &self.last_modified
    }
    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }
}

/// A named slot holding the current generation of one response body.
#[derive(Debug)]
pub struct Asset {
    name: String,
    /// Set for assets backed by a file on disk.
    path: Option<PathBuf>,
    current: RwLock<Arc<AssetGeneration>>,
}

impl Asset {
    /// Synchronously read a file and build its first generation.
    pub fn load(path: &Path, content_type: &str) -> TurfResult<Asset> {
        let stat = fs::metadata(path)
            .map_err(|e| TurfError::Asset(format!("stat {}: {e}", path.display())))?;

        let mtime = stat
            .modified()
            .map_err(|e| TurfError::Asset(format!("mtime {}: {e}", path.display())))?;

        let data = fs::read(path)
            .map_err(|e| TurfError::Asset(format!("read {}: {e}", path.display())))?;

        let generation = AssetGeneration::new(data, content_type, STATIC_CACHE, mtime)?;

        let mut asset = Asset::derived(&path.display().to_string(), generation);
        asset.path = Some(path.to_path_buf());

        Ok(asset)
    }

    /// Slot for content we compute rather than read from disk.
    pub fn derived(name: &str, generation: AssetGeneration) -> Asset {
        Asset {
            name: name.to_string(),
            path: None,
            current: RwLock::new(Arc::new(generation)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current generation.  The read lock is held only long
    /// enough to clone the pointer.
    pub fn current(&self) -> Arc<AssetGeneration> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a fully built generation.
    pub fn publish(&self, generation: AssetGeneration) {
        let fresh = Arc::new(generation);

        let old = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, fresh)
        };

        // Lock is released.  The old generation goes away here, or
        // later when the last in-flight reader lets go of it.
        drop(old);
    }

    /// Build a new generation with the provided function and publish
    /// it.  On error the current generation stays in place.
    pub fn replace<F>(&self, generator: F) -> TurfResult<()>
    where
        F: FnOnce() -> TurfResult<AssetGeneration>,
    {
        let generation = generator()?;
        self.publish(generation);
        Ok(())
    }

    /// Re-read a disk-backed asset if its modification time advanced.
    ///
    /// Returns true if a new generation was published.
    pub fn reload(&self) -> TurfResult<bool> {
        let path = match self.path.as_ref() {
            Some(p) => p,
            None => return Ok(false),
        };

        let stat = fs::metadata(path)
            .map_err(|e| TurfError::Asset(format!("stat {}: {e}", path.display())))?;

        let mtime = stat
            .modified()
            .map_err(|e| TurfError::Asset(format!("mtime {}: {e}", path.display())))?;

        let current = self.current();

        if mtime <= current.mtime() {
            return Ok(false);
        }

        let data = fs::read(path)
            .map_err(|e| TurfError::Asset(format!("read {}: {e}", path.display())))?;

        if data.len() as u64 != stat.len() {
            // Caught the file mid-write.  Try again next poll.
            return Err(TurfError::Asset(format!(
                "{} changed size while reading",
                path.display()
            )));
        }

        let generation = AssetGeneration::new(
            data,
            current.content_type(),
            current.cache_control(),
            mtime,
        )?;

        let size = generation.data().len();
        self.publish(generation);

        log::info!("Reloaded {} ({size} bytes)", self.name);

        Ok(true)
    }
}

/// Every response body the server knows how to send.
#[derive(Debug)]
pub struct AssetStore {
    pub index: Asset,
    pub about: Asset,
    pub user: Asset,
    pub favicon: Asset,
    pub score: Asset,
    pub recent: Asset,
}

impl AssetStore {
    /// Load the static files from the asset directory.
    ///
    /// Any failure here is fatal to startup.
    pub fn load(
        dir: &Path,
        score: AssetGeneration,
        recent: AssetGeneration,
    ) -> TurfResult<AssetStore> {
        Ok(AssetStore {
            index: Asset::load(&dir.join("index.html"), HTML_TYPE)?,
            about: Asset::load(&dir.join("about.html"), HTML_TYPE)?,
            user: Asset::load(&dir.join("user.html"), HTML_TYPE)?,
            favicon: Asset::load(&dir.join("favicon.ico"), ICON_TYPE)?,
            score: Asset::derived("score", score),
            recent: Asset::derived("recent", recent),
        })
    }

    /// Assets the poll worker watches for changes.
    pub fn disk_assets(&self) -> [&Asset; 4] {
        [&self.index, &self.about, &self.user, &self.favicon]
    }
}
