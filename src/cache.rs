//! Fingerprint-keyed artifact cache.
//!
//! Every processing-step boundary is identified by a `CacheKey`: a
//! SipHash-2-4 fingerprint over the product identity, the native band
//! id, the ordered step parameters and the read parameters. Two
//! requests that would produce bit-identical output share a key; any
//! parameter that changes pixel values is part of the fingerprint.
//!
//! Layout on disk: one sub-directory per product, one artifact per key
//! named `<hash16>_<band>_<step>.tif`, plus a `work/` scratch area for
//! uncommitted intermediates.

use crate::types::{PipelineError, PipelineResult, PixelWindow, ProcessingStep};
use chrono::{DateTime, Utc};
use siphasher::sip::SipHasher;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Deterministic fingerprint for one artifact.
///
/// SipHash-2-4 with the default fixed keys, so the value is stable
/// across runs, platforms and Rust versions. The label is a
/// human-readable suffix for the artifact filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    hash: u64,
    label: String,
}

impl CacheKey {
    /// Key for the artifact produced by executing `steps` (a prefix of
    /// a descriptor's chain) on one native band, read with the given
    /// resolution and window.
    pub fn new(
        product_id: &str,
        native_id: &str,
        steps: &[ProcessingStep],
        resolution_m: Option<f64>,
        window: Option<PixelWindow>,
    ) -> Self {
        let mut tokens: Vec<String> = vec![
            "v1".to_string(),
            format!("product:{}", product_id),
            format!("band:{}", native_id),
        ];
        for step in steps {
            step.fingerprint_tokens(&mut tokens);
        }
        match resolution_m {
            Some(r) => tokens.push(format!("res:{:016x}", r.to_bits())),
            None => tokens.push("res:native".to_string()),
        }
        match window {
            Some(w) => tokens.push(format!(
                "win:{}:{}:{}:{}",
                w.col_off, w.row_off, w.width, w.height
            )),
            None => tokens.push("win:full".to_string()),
        }

        let mut hasher = SipHasher::new();
        for token in &tokens {
            token.hash(&mut hasher);
        }

        let suffix = steps.last().map(Self::step_suffix).unwrap_or_else(|| "read".to_string());
        Self {
            hash: hasher.finish(),
            label: format!("{}_{}", native_id.to_lowercase(), suffix),
        }
    }

    /// Filename suffix for one step, with the parameters a developer
    /// wants visible when poking at the cache directory
    fn step_suffix(step: &ProcessingStep) -> String {
        match step {
            ProcessingStep::Calibrate { .. } => "calibrate".to_string(),
            ProcessingStep::Orthorectify { .. } => "orthorectify".to_string(),
            ProcessingStep::Despeckle { filter } => format!("despeckle_{}", filter.token()),
            ProcessingStep::MaskInvalidPixels { level } => format!("mask_{}", level.token()),
            ProcessingStep::ComputeDemDerivative { kind, .. } => {
                format!("{}", kind).to_lowercase()
            }
        }
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Deterministic artifact filename
    pub fn file_name(&self) -> String {
        format!("{:016x}_{}.tif", self.hash, self.label)
    }
}

/// A committed, read-only cache artifact
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    pub created: DateTime<Utc>,
}

/// On-disk artifact store. The only shared mutable resource in the
/// pipeline; all mutation goes through `store`, which is keyed and
/// idempotent per key.
pub struct CacheStore {
    root: PathBuf,
    persistent: bool,
    /// Set after the first failed write; the session keeps computing
    /// without persisting anything further
    disabled: AtomicBool,
    /// Per-key locks so concurrent computations of one key serialize
    /// instead of duplicating work
    in_flight: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, persistent: bool) -> PipelineResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            persistent,
            disabled: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn product_dir(&self, product_id: &str) -> PathBuf {
        self.root.join(product_id)
    }

    /// Scratch area for uncommitted intermediates of one product.
    /// Same filesystem as the committed artifacts so commits can link
    /// instead of copy.
    pub fn work_dir(&self, product_id: &str) -> PipelineResult<PathBuf> {
        let dir = self.product_dir(product_id).join("work");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Exact-match lookup: a hit requires the stored key fingerprint,
    /// never a partial or approximate match.
    pub fn lookup(&self, product_id: &str, key: &CacheKey) -> Option<CacheEntry> {
        let path = self.product_dir(product_id).join(key.file_name());
        let meta = fs::metadata(&path).ok()?;
        if meta.len() == 0 {
            // A zero-length artifact is never promoted; treat as miss
            log::warn!("ignoring empty cache artifact {}", path.display());
            return None;
        }
        log::debug!("cache hit for {} ({})", key.label(), path.display());
        Some(CacheEntry {
            key: key.clone(),
            path,
            created: meta
                .created()
                .ok()
                .map(DateTime::from)
                .unwrap_or_else(Utc::now),
        })
    }

    /// Commit a computed artifact under a key.
    ///
    /// At most one artifact is ever persisted per key: the commit is an
    /// atomic no-clobber link, and a writer that loses the race
    /// discards its bytes and adopts the winner's artifact. A write
    /// failure degrades to no-cache-this-session with a warning;
    /// recomputation proceeds without caching.
    pub fn store(&self, product_id: &str, key: &CacheKey, artifact: &Path) -> Option<CacheEntry> {
        if self.disabled.load(Ordering::Relaxed) {
            return None;
        }
        match self.try_store(product_id, key, artifact) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!(
                    "cache store failed for {} ({}); continuing without a cache this session",
                    key.label(),
                    e
                );
                self.disabled.store(true, Ordering::Relaxed);
                None
            }
        }
    }

    fn try_store(
        &self,
        product_id: &str,
        key: &CacheKey,
        artifact: &Path,
    ) -> PipelineResult<CacheEntry> {
        let dir = self.product_dir(product_id);
        fs::create_dir_all(&dir).map_err(|e| PipelineError::CacheWrite(e.to_string()))?;
        let path = dir.join(key.file_name());

        match fs::hard_link(artifact, &path) {
            Ok(()) => {
                log::debug!("cache store {} -> {}", key.label(), path.display());
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Another writer committed first; keep its artifact
                log::debug!(
                    "cache key {:016x} already committed, discarding duplicate artifact",
                    key.hash()
                );
            }
            Err(e) => return Err(PipelineError::CacheWrite(e.to_string())),
        }
        let _ = fs::remove_file(artifact);

        Ok(CacheEntry {
            key: key.clone(),
            path,
            created: Utc::now(),
        })
    }

    /// Lock guarding one key's computation. Concurrent requests for
    /// the same key block on the first computation instead of
    /// duplicating it.
    pub fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut map = self.in_flight.lock().unwrap();
        // A lock held only by the map belongs to a finished
        // computation; drop it so the map stays bounded by the number
        // of computations in flight
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry(key.hash()).or_default().clone()
    }

    /// Drop every artifact of one product
    pub fn invalidate(&self, product_id: &str) -> PipelineResult<()> {
        let dir = self.product_dir(product_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                log::info!("invalidated cache for product '{}'", product_id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Called on product disposal: drops the product's artifacts
    /// unless the caller opted into persistent retention. The `work/`
    /// scratch area goes regardless.
    pub fn teardown(&self, product_id: &str) -> PipelineResult<()> {
        if self.persistent {
            let work = self.product_dir(product_id).join("work");
            match fs::remove_dir_all(work) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            self.invalidate(product_id)
        }
    }
}
