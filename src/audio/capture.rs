use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::device::{CaptureDevice, PcmFormat};
use crate::error::DeviceError;

/// Item published by the capture loop
#[derive(Debug)]
pub enum CaptureEvent {
    /// One chunk of PCM, at most `chunk_bytes` long
    Audio(Bytes),
    /// The loop ended on its own (end of stream or device failure)
    Stopped { error: Option<DeviceError> },
}

/// Configuration for the capture loop
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub format: PcmFormat,
    /// Bytes requested per device read (3200 = 100ms of 16kHz mono)
    pub chunk_bytes: usize,
    /// Chunks buffered ahead of the consumer before new ones are dropped
    pub channel_capacity: usize,
    /// Consecutive empty reads tolerated before the device counts as stalled
    pub max_empty_reads: u32,
    /// How long `stop` waits for a blocked read to return
    pub stop_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            format: PcmFormat::mono16(16000),
            chunk_bytes: 3200,
            channel_capacity: 64,
            max_empty_reads: 200,
            stop_timeout: Duration::from_secs(1),
        }
    }
}

struct CaptureWorker {
    /// Open while publishing is allowed; closed under the lock by `stop`
    gate: Arc<Mutex<bool>>,
    handle: JoinHandle<Box<dyn CaptureDevice>>,
}

/// Audio capture loop.
///
/// Reads fixed-size chunks from the device on a dedicated thread and
/// publishes each non-empty chunk as soon as it is read.
pub struct AudioCapture {
    options: CaptureOptions,
    device: Option<Box<dyn CaptureDevice>>,
    worker: Option<CaptureWorker>,
    dropped: Arc<AtomicU64>,
}

impl AudioCapture {
    pub fn new(device: Box<dyn CaptureDevice>, options: CaptureOptions) -> Self {
        Self {
            options,
            device: Some(device),
            worker: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the device and start reading.
    ///
    /// Returns a channel receiver that will receive captured chunks.
    pub fn start(&mut self) -> Result<mpsc::Receiver<CaptureEvent>, DeviceError> {
        if self.worker.is_some() {
            warn!("Capture already started");
            return Err(DeviceError::Busy);
        }

        let mut device = self.device.take().ok_or(DeviceError::Busy)?;

        if let Err(e) = device.open(self.options.format) {
            error!("Failed to open capture device {}: {}", device.name(), e);
            self.device = Some(device);
            return Err(e);
        }

        info!(
            "Capture started on {} ({}Hz, {} channel(s), {} byte chunks)",
            device.name(),
            self.options.format.sample_rate,
            self.options.format.channels,
            self.options.chunk_bytes
        );

        let (tx, rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let gate = Arc::new(Mutex::new(true));
        let options = self.options.clone();
        let dropped = Arc::clone(&self.dropped);
        let worker_gate = Arc::clone(&gate);

        let handle = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture(device, tx, worker_gate, options, dropped))
            .map_err(|e| DeviceError::Io(format!("failed to spawn capture thread: {}", e)))?;

        self.worker = Some(CaptureWorker { gate, handle });
        Ok(rx)
    }

    /// Stop reading. Idempotent.
    ///
    /// Nothing is published once this returns. The capture thread is joined
    /// unless it stays blocked in a device read past `stop_timeout`, in which
    /// case it exits as soon as that read returns.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        *lock(&worker.gate) = false;

        let join = tokio::task::spawn_blocking(move || worker.handle.join());
        match tokio::time::timeout(self.options.stop_timeout, join).await {
            Ok(Ok(Ok(device))) => {
                debug!("Capture thread joined");
                self.device = Some(device);
            }
            Ok(Ok(Err(_))) => error!("Capture thread panicked"),
            Ok(Err(e)) => error!("Failed to join capture thread: {}", e),
            Err(_) => warn!(
                "Capture device still blocked after {} ms; thread will exit after its read",
                self.options.stop_timeout.as_millis()
            ),
        }

        info!("Capture stopped");
    }

    /// Check if the capture thread is currently running
    pub fn is_capturing(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// Chunks discarded because the consumer fell behind
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared dropped-chunk counter, readable without access to the capture
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            *lock(&worker.gate) = false;
        }
    }
}

fn run_capture(
    mut device: Box<dyn CaptureDevice>,
    tx: mpsc::Sender<CaptureEvent>,
    gate: Arc<Mutex<bool>>,
    options: CaptureOptions,
    dropped: Arc<AtomicU64>,
) -> Box<dyn CaptureDevice> {
    let mut buf = vec![0u8; options.chunk_bytes.max(2)];
    let mut empty_reads = 0u32;
    let mut chunk_index = 0u64;

    let failure = loop {
        if !*lock(&gate) {
            break None;
        }

        match device.read(&mut buf) {
            Ok(0) => {
                empty_reads += 1;
                if empty_reads >= options.max_empty_reads {
                    break Some(DeviceError::Stalled(empty_reads));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(n) => {
                empty_reads = 0;
                let chunk = Bytes::copy_from_slice(&buf[..n]);

                let open = lock(&gate);
                if !*open {
                    break None;
                }
                match tx.try_send(CaptureEvent::Audio(chunk)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("Capture consumer behind, dropped chunk {}", chunk_index);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Capture consumer gone");
                        break None;
                    }
                }
                chunk_index += 1;
            }
            Err(DeviceError::EndOfStream) => {
                info!("Capture device {} reached end of stream", device.name());
                break Some(DeviceError::EndOfStream);
            }
            Err(e) => {
                error!("Capture device {} failed: {}", device.name(), e);
                break Some(e);
            }
        }
    };

    device.close();

    // Only report an end the caller did not ask for
    if let Some(error) = failure {
        if *lock(&gate) {
            let error = match error {
                DeviceError::EndOfStream => None,
                other => Some(other),
            };
            let _ = tx.blocking_send(CaptureEvent::Stopped { error });
        }
    }

    debug!("Capture loop exited after {} chunks", chunk_index);
    device
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Yields scripted reads, then behaves like an endless live microphone
    struct ScriptedMic {
        reads: VecDeque<Result<usize, DeviceError>>,
        endless: bool,
        closed: Arc<AtomicU64>,
    }

    impl ScriptedMic {
        fn boxed(reads: Vec<Result<usize, DeviceError>>, endless: bool) -> (Box<Self>, Arc<AtomicU64>) {
            let closed = Arc::new(AtomicU64::new(0));
            let mic = Box::new(Self {
                reads: reads.into(),
                endless,
                closed: Arc::clone(&closed),
            });
            (mic, closed)
        }
    }

    impl CaptureDevice for ScriptedMic {
        fn open(&mut self, _format: PcmFormat) -> Result<(), DeviceError> {
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
            match self.reads.pop_front() {
                Some(Ok(n)) => {
                    buf[..n].fill(0xAB);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None if self.endless => {
                    std::thread::sleep(Duration::from_millis(2));
                    buf[..4].fill(1);
                    Ok(4)
                }
                None => Err(DeviceError::EndOfStream),
            }
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn options() -> CaptureOptions {
        CaptureOptions {
            chunk_bytes: 8,
            max_empty_reads: 3,
            ..CaptureOptions::default()
        }
    }

    #[tokio::test]
    async fn test_publishes_chunks_then_reports_end_of_stream() {
        let (mic, closed) = ScriptedMic::boxed(vec![Ok(8), Ok(0), Ok(6)], false);
        let mut capture = AudioCapture::new(mic, options());
        let mut rx = capture.start().unwrap();

        let mut sizes = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                CaptureEvent::Audio(chunk) => sizes.push(chunk.len()),
                CaptureEvent::Stopped { error } => {
                    assert!(error.is_none());
                    break;
                }
            }
        }

        assert_eq!(sizes, vec![8, 6]);
        capture.stop().await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_device_error_ends_loop() {
        let (mic, _) = ScriptedMic::boxed(vec![Ok(8), Err(DeviceError::Io("unplugged".into()))], false);
        let mut capture = AudioCapture::new(mic, options());
        let mut rx = capture.start().unwrap();

        assert!(matches!(rx.recv().await, Some(CaptureEvent::Audio(_))));
        match rx.recv().await {
            Some(CaptureEvent::Stopped { error: Some(DeviceError::Io(msg)) }) => {
                assert_eq!(msg, "unplugged")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_repeated_empty_reads_count_as_stall() {
        let (mic, _) = ScriptedMic::boxed(vec![Ok(0), Ok(0), Ok(0)], false);
        let mut capture = AudioCapture::new(mic, options());
        let mut rx = capture.start().unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(CaptureEvent::Stopped { error: Some(DeviceError::Stalled(3)) })
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let (mic, closed) = ScriptedMic::boxed(Vec::new(), true);
        let mut capture = AudioCapture::new(mic, options());
        let mut rx = capture.start().unwrap();

        assert!(matches!(rx.recv().await, Some(CaptureEvent::Audio(_))));
        assert!(capture.is_capturing());

        capture.stop().await;
        capture.stop().await;
        assert!(!capture.is_capturing());
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // Whatever was queued before stop drains, then the channel is closed
        while let Some(event) = rx.recv().await {
            assert!(matches!(event, CaptureEvent::Audio(_)));
        }
    }

    #[tokio::test]
    async fn test_restart_reuses_device() {
        let (mic, closed) = ScriptedMic::boxed(Vec::new(), true);
        let mut capture = AudioCapture::new(mic, options());

        let _rx = capture.start().unwrap();
        assert!(matches!(capture.start(), Err(DeviceError::Busy)));
        capture.stop().await;

        let mut rx = capture.start().unwrap();
        assert!(matches!(rx.recv().await, Some(CaptureEvent::Audio(_))));
        capture.stop().await;
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_counter_is_shared() {
        let (mic, _) = ScriptedMic::boxed(Vec::new(), true);
        let mut capture = AudioCapture::new(
            mic,
            CaptureOptions {
                channel_capacity: 1,
                ..options()
            },
        );
        let dropped = capture.dropped_counter();

        // Nobody reads, so everything past the first chunk is dropped
        let _rx = capture.start().unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while dropped.load(Ordering::Relaxed) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        capture.stop().await;
        assert_eq!(capture.dropped_chunks(), dropped.load(Ordering::Relaxed));
    }
}
