use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::device::{PcmFormat, PlaybackDevice};
use super::wav;
use crate::error::DeviceError;

/// Configuration for the playback loop
#[derive(Debug, Clone)]
pub struct PlaybackOptions {
    /// Format the output device is opened with until a container header says otherwise
    pub format: PcmFormat,
    /// Buffers held before new ones are dropped
    pub capacity: usize,
    /// How often the playback thread re-checks for shutdown while idle
    pub poll_interval: Duration,
    /// How long `stop` waits for an in-flight device write
    pub stop_timeout: Duration,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            format: PcmFormat::mono16(48000),
            capacity: 64,
            poll_interval: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(1),
        }
    }
}

/// Bounded FIFO of pending playback buffers.
///
/// Overflow drops the newest buffer and counts it.
pub struct PlaybackQueue {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    capacity: usize,
    dropped: AtomicU64,
}

impl PlaybackQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking; false when the queue is full
    pub fn push(&self, buf: Bytes) -> bool {
        match self.tx.try_send(buf) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Wait up to `timeout` for the next buffer
    pub fn take(&self, timeout: Duration) -> Option<Bytes> {
        match self.rx.recv_timeout(timeout) {
            Ok(buf) => Some(buf),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Discard everything pending, returning how many buffers were dropped
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct PlaybackWorker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<Box<dyn PlaybackDevice>>,
}

/// Audio playback loop.
///
/// The first buffer of each play session reaches the device untouched so it
/// can read the container header; later buffers have their header stripped
/// so consecutive units play as one continuous signal.
pub struct AudioPlayback {
    options: PlaybackOptions,
    queue: Arc<PlaybackQueue>,
    device: Mutex<Option<Box<dyn PlaybackDevice>>>,
    worker: Mutex<Option<PlaybackWorker>>,
    written: Arc<AtomicU64>,
}

impl AudioPlayback {
    pub fn new(device: Box<dyn PlaybackDevice>, options: PlaybackOptions) -> Self {
        Self {
            queue: Arc::new(PlaybackQueue::new(options.capacity)),
            options,
            device: Mutex::new(Some(device)),
            worker: Mutex::new(None),
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the output device and start a new play session
    pub fn start(&self) -> Result<(), DeviceError> {
        let mut worker_slot = lock(&self.worker);
        if worker_slot.is_some() {
            debug!("Playback already started");
            return Ok(());
        }

        let mut device = lock(&self.device).take().ok_or(DeviceError::Busy)?;

        if let Err(e) = device.open(self.options.format) {
            error!("Failed to open playback device {}: {}", device.name(), e);
            *lock(&self.device) = Some(device);
            return Err(e);
        }

        info!(
            "Playback started on {} ({}Hz, {} channel(s), queue capacity {})",
            device.name(),
            self.options.format.sample_rate,
            self.options.format.channels,
            self.queue.capacity()
        );

        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::clone(&self.queue);
        let written = Arc::clone(&self.written);
        let poll_interval = self.options.poll_interval;
        let thread_running = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || run_playback(device, queue, thread_running, poll_interval, written))
            .map_err(|e| DeviceError::Io(format!("failed to spawn playback thread: {}", e)))?;

        *worker_slot = Some(PlaybackWorker { running, handle });
        Ok(())
    }

    /// Queue a buffer for playback. Never blocks; false when the queue is full.
    pub fn enqueue(&self, buf: Bytes) -> bool {
        let accepted = self.queue.push(buf);
        if !accepted {
            warn!(
                "Playback queue full ({} buffers), dropping audio",
                self.queue.capacity()
            );
        }
        accepted
    }

    /// Drop pending buffers without ending the play session
    pub fn flush(&self) -> usize {
        let cleared = self.queue.clear();
        if cleared > 0 {
            debug!("Flushed {} pending playback buffers", cleared);
        }
        cleared
    }

    /// Stop playing, clear the queue and release the device. Idempotent.
    pub async fn stop(&self) {
        let worker = lock(&self.worker).take();
        let Some(worker) = worker else {
            self.queue.clear();
            return;
        };

        worker.running.store(false, Ordering::SeqCst);
        self.queue.clear();

        let join = tokio::task::spawn_blocking(move || worker.handle.join());
        match tokio::time::timeout(self.options.stop_timeout, join).await {
            Ok(Ok(Ok(device))) => {
                *lock(&self.device) = Some(device);
            }
            Ok(Ok(Err(_))) => error!("Playback thread panicked"),
            Ok(Err(e)) => error!("Failed to join playback thread: {}", e),
            Err(_) => warn!(
                "Playback device still busy after {} ms; thread will exit after its write",
                self.options.stop_timeout.as_millis()
            ),
        }

        // Anything that slipped in while the thread was winding down
        self.queue.clear();
        info!("Playback stopped");
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Buffers rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Buffers written to the device
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.running.store(false, Ordering::SeqCst);
        }
    }
}

fn run_playback(
    mut device: Box<dyn PlaybackDevice>,
    queue: Arc<PlaybackQueue>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    written: Arc<AtomicU64>,
) -> Box<dyn PlaybackDevice> {
    let mut first_chunk = true;

    while running.load(Ordering::SeqCst) {
        let Some(buf) = queue.take(poll_interval) else {
            continue;
        };
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let out = if first_chunk {
            first_chunk = false;
            buf
        } else {
            wav::strip_header(buf)
        };

        if out.is_empty() {
            continue;
        }

        if let Err(e) = device.write(&out) {
            error!("Playback device {} failed: {}", device.name(), e);
            break;
        }
        written.fetch_add(1, Ordering::Relaxed);
    }

    device.close();
    debug!("Playback loop exited");
    device
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::{WavHeader, WAV_HEADER_LEN};

    #[derive(Clone, Default)]
    struct RecordingSpeaker {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<AtomicU64>,
    }

    impl PlaybackDevice for RecordingSpeaker {
        fn open(&mut self, _format: PcmFormat) -> Result<(), DeviceError> {
            Ok(())
        }

        fn write(&mut self, buf: &[u8]) -> Result<(), DeviceError> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Ok(())
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn container(total_len: usize, fill: u8) -> Bytes {
        let header = WavHeader {
            format: PcmFormat::mono16(48000),
            data_len: (total_len - WAV_HEADER_LEN) as u32,
        };
        let mut buf = header.to_bytes().to_vec();
        buf.resize(total_len, fill);
        Bytes::from(buf)
    }

    async fn wait_for_writes(speaker: &RecordingSpeaker, count: usize) -> Vec<Vec<u8>> {
        for _ in 0..200 {
            {
                let writes = speaker.writes.lock().unwrap();
                if writes.len() >= count {
                    return writes.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} writes", count);
    }

    #[tokio::test]
    async fn test_first_chunk_keeps_header_later_chunks_are_stripped() {
        let speaker = RecordingSpeaker::default();
        let playback = AudioPlayback::new(Box::new(speaker.clone()), PlaybackOptions::default());
        playback.start().unwrap();

        let first = container(100, 1);
        let second = container(80, 2);
        assert!(playback.enqueue(first.clone()));
        assert!(playback.enqueue(second.clone()));

        let writes = wait_for_writes(&speaker, 2).await;
        assert_eq!(writes[0], first.to_vec());
        assert_eq!(writes[1].len(), 36);
        assert_eq!(writes[1], second[WAV_HEADER_LEN..].to_vec());

        playback.stop().await;
    }

    #[tokio::test]
    async fn test_plain_pcm_passes_through() {
        let speaker = RecordingSpeaker::default();
        let playback = AudioPlayback::new(Box::new(speaker.clone()), PlaybackOptions::default());
        playback.start().unwrap();

        playback.enqueue(Bytes::from(vec![9u8; 10]));
        playback.enqueue(Bytes::from(vec![8u8; 12]));

        let writes = wait_for_writes(&speaker, 2).await;
        assert_eq!(writes[0], vec![9u8; 10]);
        assert_eq!(writes[1], vec![8u8; 12]);
        playback.stop().await;
    }

    #[test]
    fn test_overflow_drops_newest() {
        let playback = AudioPlayback::new(
            Box::new(RecordingSpeaker::default()),
            PlaybackOptions {
                capacity: 4,
                ..PlaybackOptions::default()
            },
        );

        let accepted: Vec<bool> = (0..6u8)
            .map(|i| playback.enqueue(Bytes::from(vec![i; 4])))
            .collect();

        assert_eq!(accepted, vec![true, true, true, true, false, false]);
        assert_eq!(playback.queue_len(), 4);
        assert_eq!(playback.dropped(), 2);

        // The oldest buffers are the ones kept
        assert_eq!(playback.queue.take(Duration::from_millis(1)).unwrap()[0], 0);
    }

    #[tokio::test]
    async fn test_stop_clears_queue_and_releases_device() {
        let speaker = RecordingSpeaker::default();
        let playback = AudioPlayback::new(Box::new(speaker.clone()), PlaybackOptions::default());

        playback.start().unwrap();
        assert!(playback.is_playing());

        playback.stop().await;
        playback.stop().await;
        assert!(!playback.is_playing());
        assert_eq!(speaker.closed.load(Ordering::SeqCst), 1);

        // Queued while stopped, discarded by the next stop
        playback.enqueue(Bytes::from_static(&[1, 2]));
        playback.stop().await;
        assert_eq!(playback.queue_len(), 0);

        // Device came back and can be reopened
        playback.start().unwrap();
        playback.stop().await;
        assert_eq!(speaker.closed.load(Ordering::SeqCst), 2);
    }
}
