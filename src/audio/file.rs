use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::device::{CaptureDevice, PcmFormat, PlaybackDevice};
use super::wav::{WavHeader, WAV_HEADER_LEN};
use crate::error::DeviceError;

/// Capture device that plays a WAV file into the session as if spoken
pub struct WavFileCapture {
    path: PathBuf,
    name: String,
    reader: Option<WavReader<BufReader<File>>>,
    /// Sleep for the duration of each chunk so the file streams in real time
    paced: bool,
    byte_rate: u32,
}

impl WavFileCapture {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            path,
            reader: None,
            paced: true,
            byte_rate: 0,
        }
    }

    /// Disable real-time pacing (tests, batch runs)
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl CaptureDevice for WavFileCapture {
    fn open(&mut self, format: PcmFormat) -> Result<(), DeviceError> {
        info!("Opening audio file: {}", self.path.display());

        let reader = WavReader::open(&self.path)
            .map_err(|e| DeviceError::Open(format!("{}: {}", self.path.display(), e)))?;

        let spec = reader.spec();
        if spec.sample_rate != format.sample_rate
            || spec.channels != format.channels
            || spec.bits_per_sample != format.bits_per_sample
            || spec.sample_format != SampleFormat::Int
        {
            return Err(DeviceError::Open(format!(
                "{} is {}Hz {}ch {}-bit, expected {}Hz {}ch {}-bit integer PCM",
                self.path.display(),
                spec.sample_rate,
                spec.channels,
                spec.bits_per_sample,
                format.sample_rate,
                format.channels,
                format.bits_per_sample
            )));
        }

        let duration_seconds =
            reader.duration() as f64 / spec.sample_rate as f64;
        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels",
            duration_seconds, spec.sample_rate, spec.channels
        );

        self.byte_rate = format.byte_rate();
        self.reader = Some(reader);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| DeviceError::Io("device not open".to_string()))?;

        let mut filled = 0;
        let mut samples = reader.samples::<i16>();
        while filled + 2 <= buf.len() {
            match samples.next() {
                Some(sample) => {
                    buf[filled..filled + 2].copy_from_slice(&sample?.to_le_bytes());
                    filled += 2;
                }
                None => break,
            }
        }

        if filled == 0 {
            return Err(DeviceError::EndOfStream);
        }

        if self.paced && self.byte_rate > 0 {
            let micros = filled as u64 * 1_000_000 / self.byte_rate as u64;
            std::thread::sleep(Duration::from_micros(micros));
        }

        Ok(filled)
    }

    fn close(&mut self) {
        self.reader = None;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Playback device that records the assistant's audio to a WAV file.
///
/// The file format is taken from the first buffer's container header when it
/// has one, otherwise from the format the device was opened with.
pub struct WavFilePlayback {
    path: PathBuf,
    name: String,
    format: Option<PcmFormat>,
    writer: Option<WavWriter<BufWriter<File>>>,
    /// Odd trailing byte carried over to the next buffer
    pending: Option<u8>,
    samples_written: u64,
}

impl WavFilePlayback {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            path,
            format: None,
            writer: None,
            pending: None,
            samples_written: 0,
        }
    }

    fn create_writer(&mut self, format: PcmFormat) -> Result<(), DeviceError> {
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let writer = WavWriter::create(&self.path, spec)
            .map_err(|e| DeviceError::Open(format!("{}: {}", self.path.display(), e)))?;

        info!(
            "Writing playback to {} ({}Hz, {} channels)",
            self.path.display(),
            format.sample_rate,
            format.channels
        );

        self.writer = Some(writer);
        Ok(())
    }

    fn finalize(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!("Failed to finalize WAV writer: {}", e);
            } else {
                info!(
                    "Playback file complete: {} ({} samples)",
                    self.path.display(),
                    self.samples_written
                );
            }
        }
    }
}

impl PlaybackDevice for WavFilePlayback {
    fn open(&mut self, format: PcmFormat) -> Result<(), DeviceError> {
        self.format = Some(format);
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), DeviceError> {
        let mut bytes = buf;

        if self.writer.is_none() {
            let format = match WavHeader::parse(buf) {
                Some(header) => {
                    bytes = &buf[WAV_HEADER_LEN..];
                    header.format
                }
                None => self
                    .format
                    .ok_or_else(|| DeviceError::Io("device not open".to_string()))?,
            };
            self.create_writer(format)?;
        }

        let Some(writer) = self.writer.as_mut() else {
            return Err(DeviceError::Io("device not open".to_string()));
        };

        let mut iter = bytes.iter().copied();
        if let Some(low) = self.pending.take() {
            match iter.next() {
                Some(high) => {
                    writer.write_sample(i16::from_le_bytes([low, high]))?;
                    self.samples_written += 1;
                }
                None => {
                    self.pending = Some(low);
                    return Ok(());
                }
            }
        }

        let rest: Vec<u8> = iter.collect();
        let mut pairs = rest.chunks_exact(2);
        for pair in &mut pairs {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
            self.samples_written += 1;
        }
        if let [odd] = pairs.remainder() {
            self.pending = Some(*odd);
        }

        Ok(())
    }

    fn close(&mut self) {
        self.finalize();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for WavFilePlayback {
    fn drop(&mut self) {
        self.finalize();
    }
}
