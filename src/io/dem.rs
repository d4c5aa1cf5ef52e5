//! DEM provider: turns a `DemReference` into a readable local raster.
//!
//! Local paths are used in place; URLs are downloaded once into the
//! cache directory (gzip-compressed tiles are decompressed on the
//! fly). A DEM the external tool knows only by name cannot be read
//! in-process and is rejected with a remediation hint.

use crate::types::{DemReference, PipelineError, PipelineResult};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

pub struct DemProvider {
    cache_dir: PathBuf,
}

impl DemProvider {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into().join("dem"),
        }
    }

    /// Resolve a DEM reference to a local raster path. Absence of the
    /// DEM is a configuration error, never silently skipped.
    pub fn resolve(&self, dem: &DemReference) -> PipelineResult<PathBuf> {
        match dem {
            DemReference::Path(path) => {
                if path.exists() {
                    Ok(path.clone())
                } else {
                    Err(PipelineError::MissingDependency {
                        what: format!("DEM file '{}'", path.display()),
                        hint: "check the configured DEM path, or point it at a URL to download"
                            .to_string(),
                    })
                }
            }
            DemReference::Url(url) => self.fetch(url),
            DemReference::Named(name) => Err(PipelineError::MissingDependency {
                what: format!("DEM '{}'", name),
                hint: "named DEMs exist only inside the external tool; \
                       provide a local path or URL for in-process reads"
                    .to_string(),
            }),
        }
    }

    /// Download a remote DEM once; later calls reuse the cached copy
    fn fetch(&self, url: &str) -> PipelineResult<PathBuf> {
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                PipelineError::InvalidFormat(format!("DEM URL has no file name: {}", url))
            })?;
        let gzipped = file_name.ends_with(".gz");
        let local_name = if gzipped {
            file_name.trim_end_matches(".gz")
        } else {
            file_name
        };

        fs::create_dir_all(&self.cache_dir)?;
        let local_path = self.cache_dir.join(local_name);
        if local_path.exists() {
            log::debug!("DEM already cached: {}", local_path.display());
            return Ok(local_path);
        }

        log::info!("downloading DEM from {}", url);
        let response = reqwest::blocking::get(url).map_err(|e| {
            PipelineError::MissingDependency {
                what: format!("DEM download '{}'", url),
                hint: format!("check internet connection or provide a local DEM file ({})", e),
            }
        })?;
        if !response.status().is_success() {
            return Err(PipelineError::MissingDependency {
                what: format!("DEM download '{}'", url),
                hint: format!(
                    "server answered {}; check the URL or provide a local DEM file",
                    response.status()
                ),
            });
        }
        let bytes = response.bytes().map_err(|e| PipelineError::MissingDependency {
            what: format!("DEM download '{}'", url),
            hint: format!("transfer failed ({}); retry or provide a local DEM file", e),
        })?;

        // Write to a scratch file first so an interrupted download is
        // never mistaken for a cached DEM
        let mut scratch = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        if gzipped {
            let mut decoder = flate2::read::GzDecoder::new(bytes.as_ref());
            std::io::copy(&mut decoder, &mut scratch)?;
        } else {
            scratch.write_all(&bytes)?;
        }
        scratch
            .persist(&local_path)
            .map_err(|e| PipelineError::Io(e.error))?;

        log::info!("DEM cached at {}", local_path.display());
        Ok(local_path)
    }
}
