//! File Flash
//!
//! A flash image stored in a regular file, used by the `nvkv` tool.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Preamble (64 bytes)                          │
//! │   bincode(ImagePreamble), zero padded        │
//! ├──────────────────────────────────────────────┤
//! │ Device bytes (geometry.size)                 │
//! └──────────────────────────────────────────────┘
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{BlockDevice, DeviceError, DeviceResult, Geometry, ERASED_BYTE};

/// Magic identifying an nvkv flash image file
const IMAGE_MAGIC: u32 = 0x4E56_494D; // "NVIM"

/// Bytes reserved at the start of the file for the preamble
const PREAMBLE_SIZE: u64 = 64;

#[derive(Debug, Serialize, Deserialize)]
struct ImagePreamble {
    magic: u32,
    geometry: Geometry,
}

/// Flash device backed by an image file
pub struct FileFlash {
    path: PathBuf,
    file: File,
    geometry: Geometry,
}

impl FileFlash {
    /// Create a new, fully erased image file (truncating any existing one)
    pub fn create(path: &Path, geometry: Geometry) -> DeviceResult<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let preamble = ImagePreamble {
            magic: IMAGE_MAGIC,
            geometry,
        };
        let mut header = bincode::serialize(&preamble)
            .map_err(|e| DeviceError::Io(format!("failed to encode preamble: {e}")))?;
        header.resize(PREAMBLE_SIZE as usize, 0);
        file.write_all(&header)?;

        let chunk = vec![ERASED_BYTE; geometry.erase_unit.max(1)];
        let mut remaining = geometry.size;
        while remaining > 0 {
            let n = remaining.min(chunk.len() as u64) as usize;
            file.write_all(&chunk[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            geometry,
        })
    }

    /// Open an existing image file
    pub fn open(path: &Path) -> DeviceResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; PREAMBLE_SIZE as usize];
        file.read_exact(&mut header)?;
        let preamble: ImagePreamble = bincode::deserialize(&header)
            .map_err(|e| DeviceError::Io(format!("invalid image preamble: {e}")))?;

        if preamble.magic != IMAGE_MAGIC {
            return Err(DeviceError::Io(format!(
                "not an nvkv image: magic {:#010x}",
                preamble.magic
            )));
        }

        let expected = PREAMBLE_SIZE + preamble.geometry.size;
        let actual = file.metadata()?.len();
        if actual < expected {
            return Err(DeviceError::Io(format!(
                "image truncated: expected {expected} bytes, found {actual}"
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            geometry: preamble.geometry,
        })
    }

    /// Path of the image file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileFlash {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&mut self, addr: u64, buf: &mut [u8]) -> DeviceResult<()> {
        self.geometry.check(addr, buf.len() as u64, 1)?;
        self.file.seek(SeekFrom::Start(PREAMBLE_SIZE + addr))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn program(&mut self, addr: u64, data: &[u8]) -> DeviceResult<()> {
        self.geometry
            .check(addr, data.len() as u64, self.geometry.program_unit)?;

        let mut current = vec![0u8; data.len()];
        self.read(addr, &mut current)?;
        if let Some(pos) = current.iter().position(|&b| b != ERASED_BYTE) {
            return Err(DeviceError::NotErased {
                addr: addr + pos as u64,
            });
        }

        self.file.seek(SeekFrom::Start(PREAMBLE_SIZE + addr))?;
        self.file.write_all(data)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn erase(&mut self, addr: u64, len: u64) -> DeviceResult<()> {
        self.geometry.check(addr, len, self.geometry.erase_unit)?;
        self.file.seek(SeekFrom::Start(PREAMBLE_SIZE + addr))?;
        let chunk = vec![ERASED_BYTE; self.geometry.erase_unit.max(1)];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(chunk.len() as u64) as usize;
            self.file.write_all(&chunk[..n])?;
            remaining -= n as u64;
        }
        self.file.sync_data()?;
        Ok(())
    }
}
