//! Streaming AIFF writer.
//!
//! The header is written up front with zeroed length fields. Samples are appended
//! as they arrive and the three length fields are patched once, when the writer is
//! finalized. `finalize` consumes the writer, so a file cannot be patched twice.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::errors::{RecorderError, Result};

/// Bytes counted by the FORM size field that precede the sample data.
pub const FIXED_HEADER_BYTES: u32 = 46;

/// Total header length; sample data starts at this offset.
pub const HEADER_LEN: usize = 54;

pub const FORM_SIZE_OFFSET: u64 = 4;
pub const FRAME_COUNT_OFFSET: u64 = 22;
pub const SOUND_SIZE_OFFSET: u64 = 42;

const COMM_CHUNK_SIZE: u32 = 18;
/// SSND offset and block size fields counted in the chunk size.
const SOUND_CHUNK_PREFIX: u32 = 8;

/// Sample rates the writer accepts, with their 80-bit extended float encoding.
const SAMPLE_RATE_TABLE: [(u32, [u8; 10]); 9] = [
    (8_000, [0x40, 0x0b, 0xfa, 0, 0, 0, 0, 0, 0, 0]),
    (11_025, [0x40, 0x0c, 0xac, 0x44, 0, 0, 0, 0, 0, 0]),
    (16_000, [0x40, 0x0c, 0xfa, 0, 0, 0, 0, 0, 0, 0]),
    (22_050, [0x40, 0x0d, 0xac, 0x44, 0, 0, 0, 0, 0, 0]),
    (32_000, [0x40, 0x0d, 0xfa, 0, 0, 0, 0, 0, 0, 0]),
    (44_100, [0x40, 0x0e, 0xac, 0x44, 0, 0, 0, 0, 0, 0]),
    (48_000, [0x40, 0x0e, 0xbb, 0x80, 0, 0, 0, 0, 0, 0]),
    (88_200, [0x40, 0x0f, 0xac, 0x44, 0, 0, 0, 0, 0, 0]),
    (96_000, [0x40, 0x0f, 0xbb, 0x80, 0, 0, 0, 0, 0, 0]),
];

pub const SUPPORTED_BIT_DEPTHS: [u16; 3] = [16, 24, 32];

pub fn sample_rate_bytes(sample_rate: u32) -> Result<[u8; 10]> {
    SAMPLE_RATE_TABLE
        .iter()
        .find(|(rate, _)| *rate == sample_rate)
        .map(|(_, bytes)| *bytes)
        .ok_or(RecorderError::UnsupportedSampleRate(sample_rate))
}

pub fn supported_sample_rates() -> impl Iterator<Item = u32> {
    SAMPLE_RATE_TABLE.iter().map(|(rate, _)| *rate)
}

/// Stream layout for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AiffSpec {
    pub channels: u16,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
}

impl AiffSpec {
    /// Rejects layouts the writer cannot encode.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(RecorderError::InvalidChannelCount(self.channels));
        }
        if !SUPPORTED_BIT_DEPTHS.contains(&self.bits_per_sample) {
            return Err(RecorderError::UnsupportedBitDepth(self.bits_per_sample));
        }
        sample_rate_bytes(self.sample_rate)?;
        Ok(())
    }

    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    pub fn bytes_per_frame(&self) -> u64 {
        self.bytes_per_sample() as u64 * u64::from(self.channels)
    }

    fn header(&self) -> Result<[u8; HEADER_LEN]> {
        let rate = sample_rate_bytes(self.sample_rate)?;
        let mut header = [0u8; HEADER_LEN];

        header[0..4].copy_from_slice(b"FORM");
        // 4..8 form size placeholder
        header[8..12].copy_from_slice(b"AIFF");
        header[12..16].copy_from_slice(b"COMM");
        header[16..20].copy_from_slice(&COMM_CHUNK_SIZE.to_be_bytes());
        header[20..22].copy_from_slice(&self.channels.to_be_bytes());
        // 22..26 frame count placeholder
        header[26..28].copy_from_slice(&self.bits_per_sample.to_be_bytes());
        header[28..38].copy_from_slice(&rate);
        header[38..42].copy_from_slice(b"SSND");
        // 42..46 sound chunk size placeholder, 46..54 offset and block size stay zero

        Ok(header)
    }
}

/// Incremental AIFF serializer over any seekable sink.
#[derive(Debug)]
pub struct AiffWriter<W: Write + Seek> {
    sink: W,
    spec: AiffSpec,
    frames_written: u32,
    sound_bytes: u32,
    scratch: Vec<u8>,
}

/// Gives up on finding a free name after this many numbered candidates.
const MAX_NAME_ATTEMPTS: u32 = 1000;

impl AiffWriter<BufWriter<File>> {
    /// Creates a new file (and its parent directories) and writes the placeholder
    /// header. An existing file is never overwritten.
    pub fn create(path: impl AsRef<Path>, spec: AiffSpec) -> Result<Self> {
        spec.validate()?;

        let path = path.as_ref();
        create_parent(path)?;

        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        tracing::debug!("Created container file {}", path.display());
        Self::new(BufWriter::new(file), spec)
    }

    /// Like [`AiffWriter::create`], but when `path` is taken it tries
    /// `<stem>_1.<ext>`, `<stem>_2.<ext>` and so on. Returns the path actually used.
    pub fn create_unique(path: impl AsRef<Path>, spec: AiffSpec) -> Result<(Self, PathBuf)> {
        spec.validate()?;

        let path = path.as_ref();
        create_parent(path)?;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = numbered(path, attempt);
            match Self::create(&candidate, spec) {
                Ok(writer) => return Ok((writer, candidate)),
                Err(RecorderError::Io(error)) if error.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!("{} exists, trying the next name", candidate.display());
                }
                Err(error) => return Err(error),
            }
        }

        Err(RecorderError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free file name for {}", path.display()),
        )))
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn numbered(path: &Path, attempt: u32) -> PathBuf {
    if attempt == 0 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{attempt}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{attempt}"),
    };
    path.with_file_name(name)
}

impl<W: Write + Seek> AiffWriter<W> {
    pub fn new(mut sink: W, spec: AiffSpec) -> Result<Self> {
        spec.validate()?;
        let header = spec.header()?;
        sink.write_all(&header)?;

        Ok(AiffWriter {
            sink,
            spec,
            frames_written: 0,
            sound_bytes: 0,
            scratch: Vec::new(),
        })
    }

    pub fn spec(&self) -> AiffSpec {
        self.spec
    }

    pub fn frames_written(&self) -> u32 {
        self.frames_written
    }

    /// Appends interleaved samples. Narrower bit depths keep the most significant bytes.
    ///
    /// A failed write leaves the sink in an unknown state; the caller should stop
    /// appending and finalize.
    pub fn append_frames(&mut self, samples: &[i32]) -> Result<()> {
        let channels = usize::from(self.spec.channels);
        if samples.len() % channels != 0 {
            return Err(RecorderError::PartialFrame {
                len: samples.len(),
                channels: self.spec.channels,
            });
        }

        let frames = samples.len() / channels;
        let batch_bytes = frames as u64 * self.spec.bytes_per_frame();
        let frames_written = u32::try_from(frames)
            .ok()
            .and_then(|frames| self.frames_written.checked_add(frames));
        let sound_bytes = u32::try_from(batch_bytes)
            .ok()
            .and_then(|bytes| self.sound_bytes.checked_add(bytes))
            // the FORM size must also fit
            .filter(|bytes| bytes.checked_add(FIXED_HEADER_BYTES).is_some());

        let (Some(frames_written), Some(sound_bytes)) = (frames_written, sound_bytes) else {
            return Err(RecorderError::ContainerFull(self.frames_written));
        };

        let width = self.spec.bytes_per_sample();
        self.scratch.clear();
        self.scratch.reserve(samples.len() * width);
        for sample in samples {
            self.scratch.extend_from_slice(&sample.to_be_bytes()[..width]);
        }
        self.sink.write_all(&self.scratch)?;

        self.frames_written = frames_written;
        self.sound_bytes = sound_bytes;
        Ok(())
    }

    /// Patches the length fields and hands the sink back, flushed.
    pub fn finalize(mut self) -> Result<W> {
        self.sink.flush()?;

        let form_size = FIXED_HEADER_BYTES + self.sound_bytes;
        let sound_size = self.sound_bytes + SOUND_CHUNK_PREFIX;

        self.patch(FORM_SIZE_OFFSET, form_size)?;
        self.patch(FRAME_COUNT_OFFSET, self.frames_written)?;
        self.patch(SOUND_SIZE_OFFSET, sound_size)?;

        self.sink.seek(SeekFrom::End(0))?;
        self.sink.flush()?;

        tracing::debug!(
            "Container finalized: {} frames, {} sound bytes",
            self.frames_written,
            self.sound_bytes
        );
        Ok(self.sink)
    }

    fn patch(&mut self, offset: u64, value: u32) -> Result<()> {
        self.sink.seek(SeekFrom::Start(offset))?;
        self.sink.write_all(&value.to_be_bytes())?;
        Ok(())
    }
}

/// Length and format fields read back from a finished container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiffSummary {
    pub form_size: u32,
    pub channels: u16,
    pub frames: u32,
    pub bits_per_sample: u16,
    pub sample_rate: Option<u32>,
    pub sound_chunk_size: u32,
}

impl AiffSummary {
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;

        if &header[0..4] != b"FORM" || &header[8..12] != b"AIFF" || &header[38..42] != b"SSND" {
            return Err(RecorderError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "not an AIFF container written by this recorder",
            )));
        }

        let be_u32 = |at: usize| {
            u32::from_be_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]])
        };
        let be_u16 = |at: usize| u16::from_be_bytes([header[at], header[at + 1]]);

        let rate_bytes = &header[28..38];
        let sample_rate = SAMPLE_RATE_TABLE
            .iter()
            .find(|(_, bytes)| bytes.as_slice() == rate_bytes)
            .map(|(rate, _)| *rate);

        Ok(AiffSummary {
            form_size: be_u32(4),
            channels: be_u16(20),
            frames: be_u32(22),
            bits_per_sample: be_u16(26),
            sample_rate,
            sound_chunk_size: be_u32(42),
        })
    }

    pub fn read_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::read_from(File::open(path)?)
    }
}
