//! Binary storage for the preset query collection.
//!
//! File format: presets.bin
//!
//! Header (55 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - next_seq: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, ascending seq):
//! - seq: u64
//! - created_at: i64
//! - updated_at: i64
//! - id_len: u32, id: [u8; id_len] (UTF-8)
//! - text_len: u32, text: [u8; text_len] (UTF-8)
//! - embedding: [f32; dimensions]
//!
//! All integers and floats are little-endian.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::preset::records::PresetQueryRecord;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + next_seq(8) + checksum(4)
const HEADER_SIZE: usize = 55;

/// Bytes covered by the header checksum
const CHECKSUMMED_HEADER: usize = HEADER_SIZE - 4;

/// Upper bound for a stored id or text, guards against reading garbage lengths
const MAX_STRING_LEN: u32 = 16 * 1024 * 1024;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// A record with its embedding, as read from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub record: PresetQueryRecord,
    pub embedding: Vec<f32>,
}

/// Contents of a storage file.
#[derive(Debug, Default)]
pub struct StoredCollection {
    pub next_seq: u64,
    pub entries: Vec<StoredEntry>,
}

/// Storage manager for the preset query collection.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the collection from storage.
    ///
    /// # Arguments
    /// * `expected_model_id` - SHA256 hash of the expected model name
    /// * `expected_dimensions` - Expected embedding dimensions
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<StoredCollection, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = self.read_header(&mut reader)?;
        self.validate_header(&header, expected_model_id, expected_dimensions)?;

        let mut entries = Vec::with_capacity(header.entry_count.min(1 << 20) as usize);
        for _ in 0..header.entry_count {
            entries.push(self.read_entry(&mut reader, header.dimensions as usize)?);
        }

        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? != 0 {
            return Err(VectorStorageError::InvalidFormat(
                "trailing bytes after last entry".to_string(),
            ));
        }

        Ok(StoredCollection {
            next_seq: header.next_seq,
            entries,
        })
    }

    /// Save the collection to storage.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save<'a, I>(
        &self,
        entries: I,
        dimensions: usize,
        next_seq: u64,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError>
    where
        I: ExactSizeIterator<Item = (&'a PresetQueryRecord, &'a [f32])>,
    {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, entries, dimensions, next_seq, model_id);

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    fn write_to_file<'a, I>(
        &self,
        path: &Path,
        entries: I,
        dimensions: usize,
        next_seq: u64,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError>
    where
        I: ExactSizeIterator<Item = (&'a PresetQueryRecord, &'a [f32])>,
    {
        let dimensions_u16 = u16::try_from(dimensions).map_err(|_| {
            VectorStorageError::InvalidFormat(format!("{dimensions} dimensions do not fit in u16"))
        })?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions: dimensions_u16,
            entry_count: entries.len() as u64,
            next_seq,
        };
        self.write_header(&mut writer, &header)?;

        for (record, embedding) in entries {
            if embedding.len() != dimensions {
                return Err(VectorStorageError::DimensionMismatch {
                    expected: dimensions,
                    got: embedding.len(),
                });
            }
            self.write_entry(&mut writer, record, embedding)?;
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(&self, reader: &mut impl Read) -> Result<Header, VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        let version = header_bytes[0];

        // Version check first
        if version > FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(le_array(&header_bytes[CHECKSUMMED_HEADER..]));
        let computed_checksum = Self::compute_checksum(&header_bytes[..CHECKSUMMED_HEADER]);
        if stored_checksum != computed_checksum {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        Ok(Header {
            version,
            model_id,
            dimensions: u16::from_le_bytes(le_array(&header_bytes[33..35])),
            entry_count: u64::from_le_bytes(le_array(&header_bytes[35..43])),
            next_seq: u64::from_le_bytes(le_array(&header_bytes[43..51])),
        })
    }

    fn validate_header(
        &self,
        header: &Header,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        if header.dimensions as usize != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        Ok(())
    }

    fn write_header(&self, writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());
        header_bytes[43..51].copy_from_slice(&header.next_seq.to_le_bytes());

        let checksum = Self::compute_checksum(&header_bytes[..CHECKSUMMED_HEADER]);
        header_bytes[CHECKSUMMED_HEADER..].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_entry(
        &self,
        reader: &mut impl Read,
        dimensions: usize,
    ) -> Result<StoredEntry, VectorStorageError> {
        let seq = u64::from_le_bytes(read_array(reader)?);
        let created_at = i64::from_le_bytes(read_array(reader)?);
        let updated_at = i64::from_le_bytes(read_array(reader)?);
        let id = read_string(reader)?;
        let text = read_string(reader)?;

        let mut embedding = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            embedding.push(f32::from_le_bytes(read_array(reader)?));
        }

        Ok(StoredEntry {
            record: PresetQueryRecord {
                id,
                text,
                seq,
                created_at,
                updated_at,
            },
            embedding,
        })
    }

    fn write_entry(
        &self,
        writer: &mut impl Write,
        record: &PresetQueryRecord,
        embedding: &[f32],
    ) -> Result<(), VectorStorageError> {
        writer.write_all(&record.seq.to_le_bytes())?;
        writer.write_all(&record.created_at.to_le_bytes())?;
        writer.write_all(&record.updated_at.to_le_bytes())?;
        write_string(writer, &record.id)?;
        write_string(writer, &record.text)?;

        for &value in embedding {
            writer.write_all(&value.to_le_bytes())?;
        }

        Ok(())
    }

    fn compute_checksum(data: &[u8]) -> u32 {
        crc32fast::hash(data)
    }
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
    next_seq: u64,
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn read_array<const N: usize>(reader: &mut impl Read) -> Result<[u8; N], VectorStorageError> {
    let mut out = [0u8; N];
    reader.read_exact(&mut out)?;
    Ok(out)
}

fn read_string(reader: &mut impl Read) -> Result<String, VectorStorageError> {
    let len = u32::from_le_bytes(read_array(reader)?);
    if len > MAX_STRING_LEN {
        return Err(VectorStorageError::InvalidFormat(format!(
            "string length {len} exceeds {MAX_STRING_LEN}"
        )));
    }

    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| VectorStorageError::InvalidFormat(format!("invalid utf-8: {e}")))
}

fn write_string(writer: &mut impl Write, value: &str) -> Result<(), VectorStorageError> {
    let len = u32::try_from(value.len())
        .ok()
        .filter(|len| *len <= MAX_STRING_LEN)
        .ok_or_else(|| {
            VectorStorageError::InvalidFormat(format!("string of {} bytes is too long", value.len()))
        })?;

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}
