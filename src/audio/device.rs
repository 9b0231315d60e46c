use std::io::{ErrorKind, Read, Write};
use tracing::{debug, info};

use super::wav::{WavHeader, WAV_HEADER_LEN};
use crate::error::DeviceError;

/// Linear PCM format a device is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    /// Mono, signed 16-bit samples
    pub fn mono16(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            bits_per_sample: 16,
        }
    }

    /// Bytes per second of audio in this format
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * (self.bits_per_sample as u32 / 8)
    }
}

/// Microphone-like source of PCM bytes.
///
/// Devices are owned handles: the capture loop moves the device onto its own
/// thread, where `read` may block until data is available.
pub trait CaptureDevice: Send {
    fn open(&mut self, format: PcmFormat) -> Result<(), DeviceError>;

    /// Fill `buf` with up to `buf.len()` bytes, returning how many were read
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    fn close(&mut self);

    /// Device name for logging
    fn name(&self) -> &str;
}

/// Speaker-like sink of PCM bytes
pub trait PlaybackDevice: Send {
    fn open(&mut self, format: PcmFormat) -> Result<(), DeviceError>;

    fn write(&mut self, buf: &[u8]) -> Result<(), DeviceError>;

    fn close(&mut self);

    /// Device name for logging
    fn name(&self) -> &str;
}

/// Capture from a raw PCM byte stream (e.g. `arecord -t raw` on stdin)
pub struct RawPcmCapture<R> {
    reader: R,
    name: String,
}

impl<R: Read + Send> RawPcmCapture<R> {
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader,
            name: name.into(),
        }
    }
}

impl<R: Read + Send> CaptureDevice for RawPcmCapture<R> {
    fn open(&mut self, format: PcmFormat) -> Result<(), DeviceError> {
        info!(
            "Raw capture {} expects {}Hz, {} channel(s), {}-bit",
            self.name, format.sample_rate, format.channels, format.bits_per_sample
        );
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        loop {
            match self.reader.read(buf) {
                Ok(0) => return Err(DeviceError::EndOfStream),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) {}

    fn name(&self) -> &str {
        &self.name
    }
}

/// Playback into a raw PCM byte stream (e.g. `aplay -t raw` on stdout).
///
/// A raw sink cannot carry container headers, so a header on the first
/// buffer is consumed here and only its format is logged.
pub struct RawPcmPlayback<W> {
    writer: W,
    name: String,
    seen_first: bool,
}

impl<W: Write + Send> RawPcmPlayback<W> {
    pub fn new(writer: W, name: impl Into<String>) -> Self {
        Self {
            writer,
            name: name.into(),
            seen_first: false,
        }
    }
}

impl<W: Write + Send> PlaybackDevice for RawPcmPlayback<W> {
    fn open(&mut self, format: PcmFormat) -> Result<(), DeviceError> {
        self.seen_first = false;
        info!(
            "Raw playback {} opened at {}Hz, {} channel(s)",
            self.name, format.sample_rate, format.channels
        );
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), DeviceError> {
        let mut samples = buf;

        if !self.seen_first {
            self.seen_first = true;
            if let Some(header) = WavHeader::parse(buf) {
                debug!(
                    "Stream format from container: {}Hz, {} channel(s), {}-bit",
                    header.format.sample_rate,
                    header.format.channels,
                    header.format.bits_per_sample
                );
                samples = &buf[WAV_HEADER_LEN..];
            }
        }

        self.writer.write_all(samples)?;
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.writer.flush();
    }

    fn name(&self) -> &str {
        &self.name
    }
}
