//! Local audio: device abstractions, the capture and playback loops, and
//! the WAV container handling shared by both.

mod capture;
mod device;
mod file;
mod playback;
pub mod wav;

pub use capture::{AudioCapture, CaptureEvent, CaptureOptions};
pub use device::{CaptureDevice, PcmFormat, PlaybackDevice, RawPcmCapture, RawPcmPlayback};
pub use file::{WavFileCapture, WavFilePlayback};
pub use playback::{AudioPlayback, PlaybackOptions, PlaybackQueue};
