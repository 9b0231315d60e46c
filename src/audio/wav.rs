//! Fixed 44-byte RIFF/WAVE container headers.
//!
//! The service wraps every streamed audio unit in its own container. Only
//! the canonical layout is recognised: `RIFF` at offset 0, `WAVE` at 8,
//! `fmt ` fields at their fixed offsets, sample data from offset 44.

use bytes::Bytes;

use super::device::PcmFormat;

pub const WAV_HEADER_LEN: usize = 44;

/// Whether `buf` starts with a 44-byte RIFF/WAVE header
pub fn has_wav_header(buf: &[u8]) -> bool {
    buf.len() >= WAV_HEADER_LEN && &buf[0..4] == b"RIFF" && &buf[8..12] == b"WAVE"
}

/// Fields read from a container header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub format: PcmFormat,
    /// Declared length of the sample data in bytes
    pub data_len: u32,
}

impl WavHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if !has_wav_header(buf) {
            return None;
        }

        let u16_at = |offset: usize| u16::from_le_bytes([buf[offset], buf[offset + 1]]);
        let u32_at = |offset: usize| {
            u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
        };

        Some(Self {
            format: PcmFormat {
                channels: u16_at(22),
                sample_rate: u32_at(24),
                bits_per_sample: u16_at(34),
            },
            data_len: u32_at(40),
        })
    }

    /// Serialize a canonical PCM header
    pub fn to_bytes(&self) -> [u8; WAV_HEADER_LEN] {
        let format = self.format;
        let block_align = format.channels * (format.bits_per_sample / 8);
        let byte_rate = format.sample_rate * block_align as u32;

        let mut out = [0u8; WAV_HEADER_LEN];
        out[0..4].copy_from_slice(b"RIFF");
        out[4..8].copy_from_slice(&(36 + self.data_len).to_le_bytes());
        out[8..12].copy_from_slice(b"WAVE");
        out[12..16].copy_from_slice(b"fmt ");
        out[16..20].copy_from_slice(&16u32.to_le_bytes());
        out[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
        out[22..24].copy_from_slice(&format.channels.to_le_bytes());
        out[24..28].copy_from_slice(&format.sample_rate.to_le_bytes());
        out[28..32].copy_from_slice(&byte_rate.to_le_bytes());
        out[32..34].copy_from_slice(&block_align.to_le_bytes());
        out[34..36].copy_from_slice(&format.bits_per_sample.to_le_bytes());
        out[36..40].copy_from_slice(b"data");
        out[40..44].copy_from_slice(&self.data_len.to_le_bytes());
        out
    }
}

/// Drop a leading container header, leaving raw sample bytes.
///
/// Buffers without a header are returned unchanged.
pub fn strip_header(buf: Bytes) -> Bytes {
    if has_wav_header(&buf) {
        buf.slice(WAV_HEADER_LEN..)
    } else {
        buf
    }
}
