//! DSP code images: where they come from and how records are read.
//!
//! A [`DspCodeSource`] opens the image for a [`CodeImage`] and hands back a
//! [`DspCode`] cursor. The bootloader walks it twice with
//! [`next_record`]: once to write, then after [`DspCode::rewind`] to verify.

use crate::error::{HpiError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hpi_chip::dspcode::{RecordHeader, CONTINUATION, END_OF_IMAGE, WORD_BYTES};
use hpi_chip::pcie::CodeImage;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Cursor over an opened code image. Closed on drop.
pub trait DspCode: Debug + Send {
    /// Family ID this image was opened for.
    fn family(&self) -> u16;

    /// Next word.
    ///
    /// # Errors
    ///
    /// Returns a DSP code error past the end of the image.
    fn read_word(&mut self) -> Result<u32>;

    /// Next `count` words.
    ///
    /// # Errors
    ///
    /// Returns a DSP code error if fewer than `count` words remain.
    fn read_block(&mut self, count: usize) -> Result<Vec<u32>>;

    /// Back to the first word.
    fn rewind(&mut self);
}

/// Supplier of code images by family.
pub trait DspCodeSource: Debug + Send + Sync {
    /// Open the image for `image`.
    ///
    /// # Errors
    ///
    /// Returns a DSP code error if the image does not exist or is malformed.
    fn open(&self, image: CodeImage) -> Result<Box<dyn DspCode>>;
}

/// [`DspCode`] over words already in memory.
#[derive(Debug, Clone)]
pub struct CodeImageReader {
    family: u16,
    words: Arc<[u32]>,
    pos: usize,
}

impl CodeImageReader {
    /// Cursor at the start of `words`.
    #[must_use]
    pub fn new(family: u16, words: Arc<[u32]>) -> Self {
        Self {
            family,
            words,
            pos: 0,
        }
    }

    /// Decode little-endian bytes into a cursor.
    ///
    /// # Errors
    ///
    /// Returns a DSP code error if the length is not a whole number of words.
    pub fn from_bytes(family: u16, mut bytes: Bytes) -> Result<Self> {
        if bytes.len() % WORD_BYTES != 0 {
            return Err(HpiError::dsp_code(
                family,
                format!("{} bytes is not a whole number of words", bytes.len()),
            ));
        }
        let mut words = Vec::with_capacity(bytes.len() / WORD_BYTES);
        while bytes.has_remaining() {
            words.push(bytes.get_u32_le());
        }
        Ok(Self::new(family, words.into()))
    }
}

impl DspCode for CodeImageReader {
    fn family(&self) -> u16 {
        self.family
    }

    fn read_word(&mut self) -> Result<u32> {
        let word = self.words.get(self.pos).copied().ok_or_else(|| {
            HpiError::dsp_code(self.family, format!("read past end at word {}", self.pos))
        })?;
        self.pos += 1;
        Ok(word)
    }

    fn read_block(&mut self, count: usize) -> Result<Vec<u32>> {
        let end = self.pos.checked_add(count).filter(|&end| end <= self.words.len());
        let Some(end) = end else {
            return Err(HpiError::dsp_code(
                self.family,
                format!(
                    "block of {count} words at word {} overruns image of {}",
                    self.pos,
                    self.words.len()
                ),
            ));
        };
        let block = self.words[self.pos..end].to_vec();
        self.pos = end;
        Ok(block)
    }

    fn rewind(&mut self) {
        self.pos = 0;
    }
}

/// Images held in memory, keyed by family.
#[derive(Debug, Default, Clone)]
pub struct MemoryCodeSource {
    images: HashMap<u16, Arc<[u32]>>,
}

impl MemoryCodeSource {
    /// Empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the image for `image`.
    #[must_use]
    pub fn with_image(mut self, image: CodeImage, words: impl Into<Arc<[u32]>>) -> Self {
        self.images.insert(image.id(), words.into());
        self
    }
}

impl DspCodeSource for MemoryCodeSource {
    fn open(&self, image: CodeImage) -> Result<Box<dyn DspCode>> {
        let words = self
            .images
            .get(&image.id())
            .ok_or_else(|| HpiError::dsp_code(image.id(), "no image loaded"))?;
        Ok(Box::new(CodeImageReader::new(image.id(), Arc::clone(words))))
    }
}

/// Images read from `dsp<family>.bin` files under a directory.
#[derive(Debug, Clone)]
pub struct FileCodeSource {
    dir: PathBuf,
}

impl FileCodeSource {
    /// Conventional firmware location.
    pub const DEFAULT_DIR: &'static str = "/lib/firmware/asihpi";

    /// Source reading from `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the file for `image`.
    #[must_use]
    pub fn path_for(&self, image: CodeImage) -> PathBuf {
        self.dir.join(image.file_name())
    }
}

impl DspCodeSource for FileCodeSource {
    fn open(&self, image: CodeImage) -> Result<Box<dyn DspCode>> {
        let path = self.path_for(image);
        let data = std::fs::read(&path)
            .map_err(|e| HpiError::dsp_code(image.id(), format!("{}: {e}", path.display())))?;
        debug!("Opened {} ({} bytes)", path.display(), data.len());
        Ok(Box::new(CodeImageReader::from_bytes(image.id(), Bytes::from(data))?))
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRecord {
    /// Length, address and type.
    pub header: RecordHeader,
    /// Data words.
    pub words: Vec<u32>,
}

/// Read the next record, or `None` at the end sentinel.
///
/// # Errors
///
/// Returns a DSP code error if the image ends mid-record.
pub fn next_record(code: &mut dyn DspCode) -> Result<Option<CodeRecord>> {
    let mut length = code.read_word()?;
    if length == END_OF_IMAGE {
        return Ok(None);
    }
    if length == CONTINUATION {
        length = code.read_word()?;
        if length == END_OF_IMAGE {
            return Ok(None);
        }
    }
    let address = code.read_word()?;
    if address as usize % WORD_BYTES != 0 {
        return Err(HpiError::dsp_code(
            code.family(),
            format!("record at {address:#010x} is not word aligned"),
        ));
    }
    let kind = code.read_word()?;
    let words = code.read_block(length as usize)?;
    Ok(Some(CodeRecord {
        header: RecordHeader {
            length,
            address,
            kind,
        },
        words,
    }))
}

/// Read every record of an image from the start.
///
/// # Errors
///
/// Returns a DSP code error if the image is malformed.
pub fn read_all(code: &mut dyn DspCode) -> Result<Vec<CodeRecord>> {
    code.rewind();
    let mut records = Vec::new();
    while let Some(record) = next_record(code)? {
        records.push(record);
    }
    Ok(records)
}

/// Assemble an image from records.
#[derive(Debug, Default, Clone)]
pub struct ImageBuilder {
    words: Vec<u32>,
}

impl ImageBuilder {
    /// Empty image.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record of `data` at `address`.
    #[must_use]
    pub fn record(mut self, address: u32, kind: u32, data: &[u32]) -> Self {
        // Truncation safe: records are far below 4G words
        #[allow(clippy::cast_possible_truncation)]
        self.words.push(data.len() as u32);
        self.words.push(address);
        self.words.push(kind);
        self.words.extend_from_slice(data);
        self
    }

    /// Append a segment continuation marker.
    #[must_use]
    pub fn continuation(mut self) -> Self {
        self.words.push(CONTINUATION);
        self
    }

    /// Terminated word stream.
    #[must_use]
    pub fn build(mut self) -> Vec<u32> {
        self.words.push(END_OF_IMAGE);
        self.words
    }

    /// Terminated image as little-endian bytes.
    #[must_use]
    pub fn build_bytes(self) -> Bytes {
        let words = self.build();
        let mut buf = BytesMut::with_capacity(words.len() * WORD_BYTES);
        for word in words {
            buf.put_u32_le(word);
        }
        buf.freeze()
    }
}
