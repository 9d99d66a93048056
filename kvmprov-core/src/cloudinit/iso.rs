//! Minimal ISO-9660 writer for cloud-init seed images.
//!
//! Produces a single-directory image: system area, primary volume
//! descriptor, set terminator, L and M path tables, the root directory and
//! then file extents. File identifiers are written verbatim (no `;1`
//! version suffix) so guests see `user-data` rather than `USER_DAT.;1`.

use crate::error::{ProvisionError, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::io::Write;

pub const SECTOR_SIZE: usize = 2048;

const SYSTEM_AREA_SECTORS: usize = 16;
const L_PATH_TABLE_SECTOR: u32 = 18;
const M_PATH_TABLE_SECTOR: u32 = 19;
const ROOT_DIR_SECTOR: u32 = 20;
const FIRST_FILE_SECTOR: u32 = 21;

/// Root-only path table: one 8-byte header, 1-byte identifier, 1 pad byte.
const PATH_TABLE_SIZE: u32 = 10;
const MAX_IDENTIFIER_LEN: usize = 64;
const FLAG_DIRECTORY: u8 = 0x02;

struct IsoFile {
    name: String,
    data: Vec<u8>,
}

/// In-memory description of an image, serialized by [`IsoWriter::write_to`].
pub struct IsoWriter {
    volume_id: String,
    timestamp: DateTime<Utc>,
    files: Vec<IsoFile>,
}

impl IsoWriter {
    pub fn new(volume_id: impl Into<String>) -> Self {
        Self { volume_id: volume_id.into(), timestamp: Utc::now(), files: Vec::new() }
    }

    /// Stamp every date field with `timestamp` instead of the current time.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add a top-level file.
    pub fn add_file(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
            return Err(iso_err(format!("invalid file identifier length: '{}'", name)));
        }
        if !name.bytes().all(|b| b.is_ascii_graphic() && b != b'/' && b != b';') {
            return Err(iso_err(format!("invalid characters in file identifier '{}'", name)));
        }
        if self.files.iter().any(|f| f.name == name) {
            return Err(iso_err(format!("duplicate file identifier '{}'", name)));
        }
        self.files.push(IsoFile { name, data: data.into() });
        Ok(())
    }

    /// Serialize the whole image into a buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Serialize the image into `out`.
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        if self.volume_id.is_empty() || self.volume_id.len() > 32 || !self.volume_id.is_ascii() {
            return Err(iso_err(format!("invalid volume identifier '{}'", self.volume_id)));
        }

        let mut files: Vec<&IsoFile> = self.files.iter().collect();
        files.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

        // Lay out file extents.
        let mut extents = Vec::with_capacity(files.len());
        let mut next = FIRST_FILE_SECTOR;
        for file in &files {
            extents.push(next);
            next = next
                .checked_add(sectors_for(file.data.len())?)
                .ok_or_else(|| iso_err("image exceeds addressable size"))?;
        }
        let total_sectors = next;

        let root_dir = self.root_directory(&files, &extents)?;

        // Sectors 0-15, then 16 through 20 in order.
        emit(out, &[0u8; SECTOR_SIZE * SYSTEM_AREA_SECTORS])?;
        emit(out, &self.primary_volume_descriptor(total_sectors))?;
        emit(out, &terminator())?;
        emit(out, &path_table(false))?;
        emit(out, &path_table(true))?;
        emit(out, &root_dir)?;

        for file in &files {
            emit(out, &file.data)?;
            let pad = padding(file.data.len());
            if pad > 0 {
                emit(out, &vec![0u8; pad])?;
            }
        }

        out.flush().map_err(|e| iso_err(format!("failed to flush output: {}", e)))
    }

    fn primary_volume_descriptor(&self, total_sectors: u32) -> Vec<u8> {
        let mut s = vec![0u8; SECTOR_SIZE];
        s[0] = 1;
        s[1..6].copy_from_slice(b"CD001");
        s[6] = 1;
        fill_str(&mut s[8..40], "LINUX");
        fill_str(&mut s[40..72], &self.volume_id);
        both_u32(&mut s[80..88], total_sectors);
        both_u16(&mut s[120..124], 1);
        both_u16(&mut s[124..128], 1);
        both_u16(&mut s[128..132], SECTOR_SIZE as u16);
        both_u32(&mut s[132..140], PATH_TABLE_SIZE);
        s[140..144].copy_from_slice(&L_PATH_TABLE_SECTOR.to_le_bytes());
        s[148..152].copy_from_slice(&M_PATH_TABLE_SECTOR.to_be_bytes());
        s[156..190].copy_from_slice(&self.dir_record(
            &[0],
            ROOT_DIR_SECTOR,
            SECTOR_SIZE as u32,
            FLAG_DIRECTORY,
        ));
        fill_str(&mut s[190..318], "");
        fill_str(&mut s[318..446], "");
        fill_str(&mut s[446..574], "");
        fill_str(&mut s[574..702], "KVMPROV");
        fill_str(&mut s[702..813], "");
        let stamp = dec_datetime(&self.timestamp);
        s[813..830].copy_from_slice(&stamp);
        s[830..847].copy_from_slice(&stamp);
        s[847..864].copy_from_slice(&unset_datetime());
        s[864..881].copy_from_slice(&stamp);
        s[881] = 1;
        s
    }

    fn root_directory(&self, files: &[&IsoFile], extents: &[u32]) -> Result<Vec<u8>> {
        let mut dir = Vec::with_capacity(SECTOR_SIZE);
        dir.extend(self.dir_record(&[0], ROOT_DIR_SECTOR, SECTOR_SIZE as u32, FLAG_DIRECTORY));
        dir.extend(self.dir_record(&[1], ROOT_DIR_SECTOR, SECTOR_SIZE as u32, FLAG_DIRECTORY));
        for (file, extent) in files.iter().zip(extents) {
            let len = u32::try_from(file.data.len())
                .map_err(|_| iso_err(format!("file '{}' too large", file.name)))?;
            dir.extend(self.dir_record(file.name.as_bytes(), *extent, len, 0));
        }
        if dir.len() > SECTOR_SIZE {
            return Err(iso_err("root directory does not fit in one sector"));
        }
        dir.resize(SECTOR_SIZE, 0);
        Ok(dir)
    }

    fn dir_record(&self, id: &[u8], extent: u32, len: u32, flags: u8) -> Vec<u8> {
        let pad = usize::from(id.len() % 2 == 0);
        let record_len = 33 + id.len() + pad;
        let mut r = vec![0u8; record_len];
        r[0] = record_len as u8;
        both_u32(&mut r[2..10], extent);
        both_u32(&mut r[10..18], len);
        r[18..25].copy_from_slice(&record_datetime(&self.timestamp));
        r[25] = flags;
        both_u16(&mut r[28..32], 1);
        r[32] = id.len() as u8;
        r[33..33 + id.len()].copy_from_slice(id);
        r
    }
}

fn iso_err(reason: impl Into<String>) -> ProvisionError {
    ProvisionError::IsoWrite { reason: reason.into() }
}

fn emit<W: Write>(out: &mut W, bytes: &[u8]) -> Result<()> {
    out.write_all(bytes).map_err(|e| iso_err(format!("failed to write image: {}", e)))
}

fn sectors_for(len: usize) -> Result<u32> {
    u32::try_from(len.div_ceil(SECTOR_SIZE)).map_err(|_| iso_err("file too large"))
}

fn padding(len: usize) -> usize {
    (SECTOR_SIZE - len % SECTOR_SIZE) % SECTOR_SIZE
}

fn terminator() -> Vec<u8> {
    let mut s = vec![0u8; SECTOR_SIZE];
    s[0] = 255;
    s[1..6].copy_from_slice(b"CD001");
    s[6] = 1;
    s
}

fn path_table(big_endian: bool) -> Vec<u8> {
    let mut s = vec![0u8; SECTOR_SIZE];
    s[0] = 1;
    if big_endian {
        s[2..6].copy_from_slice(&ROOT_DIR_SECTOR.to_be_bytes());
        s[6..8].copy_from_slice(&1u16.to_be_bytes());
    } else {
        s[2..6].copy_from_slice(&ROOT_DIR_SECTOR.to_le_bytes());
        s[6..8].copy_from_slice(&1u16.to_le_bytes());
    }
    s
}

fn both_u16(dst: &mut [u8], v: u16) {
    dst[..2].copy_from_slice(&v.to_le_bytes());
    dst[2..4].copy_from_slice(&v.to_be_bytes());
}

fn both_u32(dst: &mut [u8], v: u32) {
    dst[..4].copy_from_slice(&v.to_le_bytes());
    dst[4..8].copy_from_slice(&v.to_be_bytes());
}

fn fill_str(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    let n = s.len().min(dst.len());
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
}

/// 17-byte volume descriptor timestamp, UTC.
fn dec_datetime(t: &DateTime<Utc>) -> [u8; 17] {
    let mut out = [0u8; 17];
    let text = format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}00",
        t.year().clamp(0, 9999),
        t.month(),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    );
    out[..16].copy_from_slice(text.as_bytes());
    out
}

fn unset_datetime() -> [u8; 17] {
    let mut out = [b'0'; 17];
    out[16] = 0;
    out
}

/// 7-byte directory record timestamp, UTC.
fn record_datetime(t: &DateTime<Utc>) -> [u8; 7] {
    [
        (t.year() - 1900).clamp(0, 255) as u8,
        t.month() as u8,
        t.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
        0,
    ]
}
