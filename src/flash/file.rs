use crate::flash::{FlashDevice, FlashError};
use crate::layout::WORD_SIZE;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const GEOMETRY_FILE: &str = "geometry.json";
const REGION_FILES: [&str; 2] = ["region-0.bin", "region-1.bin"];

/// Declared shape of an on-disk flash image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashGeometry {
    pub swap_size: u32,
}

/// Host-side flash image: one file per region plus a geometry sidecar.
///
/// Region contents are cached in memory. Writes AND into the cache, keeping
/// the 1 -> 0 monotonicity of real NOR, and write through to the backing
/// file before returning.
#[derive(Debug)]
pub struct FileFlash {
    dir: PathBuf,
    swap_size: u32,
    cache: Mutex<[Vec<u8>; 2]>,
    files: [File; 2],
}

impl FileFlash {
    /// Creates the image directory, or adopts an existing one with matching
    /// geometry.
    pub fn create(dir: impl Into<PathBuf>, swap_size: u32) -> Result<Self, FlashError> {
        assert!(
            swap_size % WORD_SIZE == 0,
            "swap size {swap_size} is not word-aligned"
        );
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let geometry = FlashGeometry { swap_size };
        if dir.join(GEOMETRY_FILE).exists() {
            let existing = load_geometry(&dir)?;
            if existing != geometry {
                return Err(FlashError::Geometry(format!(
                    "image at {} already declares swap_size={}",
                    dir.display(),
                    existing.swap_size
                )));
            }
        } else {
            persist_geometry(&dir, &geometry)?;
        }
        Self::from_geometry(dir, geometry)
    }

    /// Opens an existing image directory, reading its geometry sidecar.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, FlashError> {
        let dir = dir.into();
        let geometry = load_geometry(&dir)?;
        Self::from_geometry(dir, geometry)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn from_geometry(dir: PathBuf, geometry: FlashGeometry) -> Result<Self, FlashError> {
        let size = geometry.swap_size as usize;
        let (file0, cache0) = open_region(&dir, REGION_FILES[0], size)?;
        let (file1, cache1) = open_region(&dir, REGION_FILES[1], size)?;
        Ok(Self {
            dir,
            swap_size: geometry.swap_size,
            cache: Mutex::new([cache0, cache1]),
            files: [file0, file1],
        })
    }

    fn check_access(&self, region: u8, offset: u32, len: usize) -> Result<(), FlashError> {
        if region > 1 {
            return Err(FlashError::InvalidRegion(region));
        }
        if u64::from(offset) + len as u64 > u64::from(self.swap_size) {
            return Err(FlashError::OutOfBounds {
                offset,
                len,
                swap_size: self.swap_size,
            });
        }
        Ok(())
    }

    fn write_through(&mut self, region: u8, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        let file = &mut self.files[region as usize];
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        file.write_all(bytes)?;
        file.sync_data()?;
        Ok(())
    }
}

impl FlashDevice for FileFlash {
    fn init(&mut self) -> Result<(), FlashError> {
        Ok(())
    }

    fn swap_size(&self) -> u32 {
        self.swap_size
    }

    fn erase(&mut self, region: u8) -> Result<(), FlashError> {
        self.check_access(region, 0, 0)?;
        let blank = vec![0xFF; self.swap_size as usize];
        self.cache.get_mut()[region as usize].fill(0xFF);
        self.write_through(region, 0, &blank)
    }

    fn read(&self, region: u8, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_access(region, offset, buf.len())?;
        let cache = self.cache.lock();
        let start = offset as usize;
        buf.copy_from_slice(&cache[region as usize][start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, region: u8, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if offset % WORD_SIZE != 0 || data.len() % WORD_SIZE as usize != 0 {
            return Err(FlashError::Misaligned {
                offset,
                len: data.len(),
            });
        }
        self.check_access(region, offset, data.len())?;
        let start = offset as usize;
        let merged: Vec<u8> = {
            let cache = self.cache.get_mut();
            let cells = &mut cache[region as usize][start..start + data.len()];
            for (cell, byte) in cells.iter_mut().zip(data) {
                *cell &= byte;
            }
            cells.to_vec()
        };
        self.write_through(region, offset, &merged)
    }
}

fn open_region(dir: &Path, name: &str, size: usize) -> Result<(File, Vec<u8>), FlashError> {
    let path = dir.join(name);
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)?;
    let mut bytes = Vec::with_capacity(size);
    file.read_to_end(&mut bytes)?;
    if bytes.len() != size {
        // Fresh or resized image: the region starts erased.
        bytes = vec![0xFF; size];
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        file.sync_data()?;
    }
    Ok((file, bytes))
}

fn load_geometry(dir: &Path) -> Result<FlashGeometry, FlashError> {
    let path = dir.join(GEOMETRY_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(FlashError::Geometry(format!(
                "missing geometry sidecar at {}",
                path.display()
            )));
        }
        Err(err) => return Err(FlashError::Io(err)),
    };
    serde_json::from_slice(&bytes)
        .map_err(|err| FlashError::Geometry(format!("invalid {}: {err}", path.display())))
}

fn persist_geometry(dir: &Path, geometry: &FlashGeometry) -> Result<(), FlashError> {
    let payload = serde_json::to_vec_pretty(geometry)
        .map_err(|err| FlashError::Geometry(err.to_string()))?;
    let path = dir.join(GEOMETRY_FILE);
    let tmp_path = path.with_extension("tmp");
    let mut file = File::create(&tmp_path)?;
    file.write_all(&payload)?;
    file.sync_all()?;
    fs::rename(tmp_path, path)?;
    Ok(())
}
