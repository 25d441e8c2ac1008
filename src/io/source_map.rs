use anyhow::{Context, Result, bail};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read-only memory mapping of a source file
///
/// Cloning is cheap and shares the same mapping. Worker processes open their
/// own mapping of the same path, which the OS backs with the same pages.
#[derive(Clone)]
pub struct SourceMap {
    path: PathBuf,
    map: Option<Arc<Mmap>>,
}

impl SourceMap {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("Failed to open source file {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("Failed to stat source file {}", path.display()))?
            .len();

        // Zero-length mappings are rejected on some platforms
        let map = if len == 0 {
            None
        } else {
            // SAFETY: the mapping is read-only and the loader never writes to
            // source files. Concurrent truncation by another program is caught
            // by the size check workers perform against the manifest.
            let mmap = unsafe { Mmap::map(&file) }
                .with_context(|| format!("Failed to map source file {}", path.display()))?;
            Some(Arc::new(mmap))
        };

        Ok(Self { path, map })
    }

    /// Open the mapping and verify it still has the size recorded at planning time
    pub fn open_expecting(path: impl AsRef<Path>, expected_len: u64) -> Result<Self> {
        let source = Self::open(path)?;
        if source.len() != expected_len {
            bail!(
                "Source file {} changed size since partitioning ({} bytes, expected {})",
                source.path.display(),
                source.len(),
                expected_len
            );
        }
        Ok(source)
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.map {
            Some(map) => map,
            None => &[],
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
