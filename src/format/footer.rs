//! FOOTER — fixed 80 bytes, ends the stream.
//!
//! ```text
//! Offset  Size  Field
//!    0      8   data_start    (LE u64)
//!    8      8   data_length   (LE u64)
//!   16      8   meta_start    (LE u64)
//!   24      8   meta_length   (LE u64)
//!   32      8   index_start   (LE u64)
//!   40      8   index_length  (LE u64)
//!   48      8   file_count    (LE u64)
//!   56      2   version       (LE u16)
//!   58     14   reserved      (zero padding)
//!   72      8   magic         = "DESFOOT1" (8 ASCII bytes, not LE)
//! ```
//!
//! Reading the last 80 bytes of the object is always enough to locate the
//! INDEX: `footer_start = object_size - 80`.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{DesError, DesResult};

use super::FOOTER_SIZE;

pub const MAGIC: &[u8; 8] = b"DESFOOT1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub data_start: u64,
    pub data_length: u64,
    pub meta_start: u64,
    pub meta_length: u64,
    pub index_start: u64,
    pub index_length: u64,
    pub file_count: u64,
    pub version: u16,
}

impl Footer {
    pub fn footer_start(&self) -> u64 {
        self.index_start + self.index_length
    }

    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.data_start)?;
        w.write_u64::<LittleEndian>(self.data_length)?;
        w.write_u64::<LittleEndian>(self.meta_start)?;
        w.write_u64::<LittleEndian>(self.meta_length)?;
        w.write_u64::<LittleEndian>(self.index_start)?;
        w.write_u64::<LittleEndian>(self.index_length)?;
        w.write_u64::<LittleEndian>(self.file_count)?;
        w.write_u16::<LittleEndian>(self.version)?;
        w.write_all(&[0u8; 14])?; // reserved
        w.write_all(MAGIC)
    }

    /// Parse a footer from exactly `FOOTER_SIZE` bytes (the trailing 80
    /// bytes of the object) and check every self-consistency invariant from
    /// spec §3.1 except the ones that need the object's total size — the
    /// caller (range/local reader) checks `footer_start + 80 == object_size`
    /// since only it knows the object size.
    pub fn parse(buf: &[u8]) -> DesResult<Self> {
        if buf.len() != FOOTER_SIZE {
            return Err(DesError::CorruptContainer(format!(
                "footer buffer is {} bytes, expected {FOOTER_SIZE}",
                buf.len()
            )));
        }
        if &buf[72..80] != MAGIC {
            return Err(DesError::CorruptContainer("bad FOOTER magic".into()));
        }

        let mut cursor = &buf[0..58];
        let data_start = cursor.read_u64::<LittleEndian>()?;
        let data_length = cursor.read_u64::<LittleEndian>()?;
        let meta_start = cursor.read_u64::<LittleEndian>()?;
        let meta_length = cursor.read_u64::<LittleEndian>()?;
        let index_start = cursor.read_u64::<LittleEndian>()?;
        let index_length = cursor.read_u64::<LittleEndian>()?;
        let file_count = cursor.read_u64::<LittleEndian>()?;
        let version = cursor.read_u16::<LittleEndian>()?;

        if version > super::FORMAT_VERSION {
            return Err(DesError::CorruptContainer(format!(
                "unsupported container version {version}"
            )));
        }

        let footer = Self {
            data_start,
            data_length,
            meta_start,
            meta_length,
            index_start,
            index_length,
            file_count,
            version,
        };
        footer.check_offsets()?;
        Ok(footer)
    }

    /// Invariants from spec §3.1 that don't require the object's total size.
    fn check_offsets(&self) -> DesResult<()> {
        if self.data_start != super::DATA_START {
            return Err(DesError::CorruptContainer(format!(
                "data_start {} != {}",
                self.data_start,
                super::DATA_START
            )));
        }
        if self.meta_start != self.data_start + self.data_length {
            return Err(DesError::CorruptContainer(
                "meta_start does not follow data region".into(),
            ));
        }
        if self.index_start != self.meta_start + self.meta_length {
            return Err(DesError::CorruptContainer(
                "index_start does not follow meta region".into(),
            ));
        }
        Ok(())
    }

    /// The full self-consistency check spec §4.3 requires of a range
    /// reader: `footer_start + 80 == object_size`.
    pub fn check_against_object_size(&self, object_size: u64) -> DesResult<()> {
        if self.footer_start() + FOOTER_SIZE as u64 != object_size {
            return Err(DesError::CorruptContainer(format!(
                "footer_start ({}) + 80 != object_size ({object_size})",
                self.footer_start()
            )));
        }
        Ok(())
    }

    pub fn read<R: Read>(mut r: R) -> DesResult<Self> {
        let mut buf = [0u8; FOOTER_SIZE];
        r.read_exact(&mut buf)?;
        Self::parse(&buf)
    }
}
