//! File Pool Module
//!
//! Process-wide cache of decoded sample data. SFZ load time issues
//! synchronous preload requests that keep the first frames of every file
//! resident; during playback, voices that run past the preloaded prefix
//! enqueue a streaming request and background loader threads publish the
//! full file through an atomic pointer the audio thread polls without
//! locking.
//!
//! Decoding sits behind the [`AudioReader`] trait. The default reader
//! decodes WAV through hound; tests and embedders can install an
//! [`InMemoryReader`] instead.

use crate::buffer::StereoBuffer;
use crate::config::{self, LOADING_QUEUE_CAPACITY, NUM_LOADING_THREADS};
use crate::dsp::{interpolate, InterpolatorModel};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, warn};
use thiserror::Error;

/// File pool failures.
#[derive(Debug, Error)]
pub enum FilePoolError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("unsupported channel count {0}, only mono and stereo files load")]
    UnsupportedChannelCount(u16),

    #[error("decoder error: {0}")]
    Decoder(String),

    #[error("streaming queue is full")]
    QueueFull,
}

/// Decoded file properties.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioMetadata {
    pub num_channels: u16,
    pub total_frames: u32,
    pub sample_rate: f64,
    pub root_key: Option<u8>,
    pub loop_begin: Option<u32>,
    pub loop_end: Option<u32>,
}

/// Abstraction over sample decoding.
///
/// Implementations return planar stereo data; mono sources are duplicated
/// into both channels.
pub trait AudioReader: Send + Sync {
    /// Decodes up to `max_frames` frames of a file.
    fn read_frames(
        &self,
        path: &Path,
        max_frames: u32,
    ) -> Result<(AudioMetadata, StereoBuffer), FilePoolError>;
}

/// WAV decoding through hound.
///
/// The sampler chunk is not decoded, so root key and loop metadata come
/// back empty; regions supply them through opcodes instead.
#[derive(Debug, Default)]
pub struct WavFileReader;

impl AudioReader for WavFileReader {
    fn read_frames(
        &self,
        path: &Path,
        max_frames: u32,
    ) -> Result<(AudioMetadata, StereoBuffer), FilePoolError> {
        if !path.exists() {
            return Err(FilePoolError::FileNotFound(path.to_path_buf()));
        }

        let mut reader = hound::WavReader::open(path)
            .map_err(|error| FilePoolError::Decoder(error.to_string()))?;
        let spec = reader.spec();

        if spec.channels != 1 && spec.channels != 2 {
            return Err(FilePoolError::UnsupportedChannelCount(spec.channels));
        }

        let total_frames = reader.duration();
        let frames_to_read = total_frames.min(max_frames) as usize;
        let samples_to_read = frames_to_read * spec.channels as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .take(samples_to_read)
                .collect::<Result<_, _>>()
                .map_err(|error| FilePoolError::Decoder(error.to_string()))?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1u32 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .take(samples_to_read)
                    .map(|sample| sample.map(|value| value as f32 * scale))
                    .collect::<Result<_, _>>()
                    .map_err(|error| FilePoolError::Decoder(error.to_string()))?
            }
        };

        let mut buffer = StereoBuffer::new(frames_to_read);
        if spec.channels == 1 {
            let (left, right) = buffer.both_mut();
            for (frame, &sample) in interleaved.iter().enumerate() {
                left[frame] = sample;
                right[frame] = sample;
            }
        } else {
            buffer.read_interleaved(&interleaved);
        }

        let metadata = AudioMetadata {
            num_channels: spec.channels,
            total_frames,
            sample_rate: spec.sample_rate as f64,
            root_key: None,
            loop_begin: None,
            loop_end: None,
        };

        Ok((metadata, buffer))
    }
}

/// Virtual file entry for the in-memory reader.
#[derive(Debug, Clone)]
pub struct InMemoryFile {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
    pub sample_rate: f64,
    pub root_key: Option<u8>,
    pub loop_begin: Option<u32>,
    pub loop_end: Option<u32>,
}

impl InMemoryFile {
    /// Mono source, duplicated into both channels on read.
    pub fn mono(data: Vec<f32>, sample_rate: f64) -> Self {
        Self {
            right: data.clone(),
            left: data,
            sample_rate,
            root_key: None,
            loop_begin: None,
            loop_end: None,
        }
    }
}

/// Reader over a virtual filesystem, for tests and embedders.
#[derive(Debug, Default)]
pub struct InMemoryReader {
    files: Mutex<HashMap<PathBuf, InMemoryFile>>,
}

impl InMemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a virtual file.
    pub fn insert(&self, path: impl Into<PathBuf>, file: InMemoryFile) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.into(), file);
        }
    }
}

impl AudioReader for InMemoryReader {
    fn read_frames(
        &self,
        path: &Path,
        max_frames: u32,
    ) -> Result<(AudioMetadata, StereoBuffer), FilePoolError> {
        let files = self
            .files
            .lock()
            .map_err(|_| FilePoolError::Decoder("reader poisoned".into()))?;
        let file = files
            .get(path)
            .ok_or_else(|| FilePoolError::FileNotFound(path.to_path_buf()))?;

        let total_frames = file.left.len().min(file.right.len()) as u32;
        let frames = total_frames.min(max_frames) as usize;
        let mut buffer = StereoBuffer::new(frames);
        buffer.left_mut().copy_from_slice(&file.left[..frames]);
        buffer.right_mut().copy_from_slice(&file.right[..frames]);

        Ok((
            AudioMetadata {
                num_channels: 2,
                total_frames,
                sample_rate: file.sample_rate,
                root_key: file.root_key,
                loop_begin: file.loop_begin,
                loop_end: file.loop_end,
            },
            buffer,
        ))
    }
}

/// Shared handle to one cached file.
///
/// `preloaded` is immutable for the handle's lifetime. `full` transitions
/// at most once from null to a fully loaded buffer; once a voice observes
/// it non-null, any frame below `total_frames` may be read.
#[derive(Debug)]
pub struct FileHandle {
    pub metadata: AudioMetadata,
    preloaded: StereoBuffer,
    full: AtomicPtr<StereoBuffer>,
}

// `full` is only written once through a release store and the pointed-to
// buffer is never mutated afterwards.
unsafe impl Send for FileHandle {}
unsafe impl Sync for FileHandle {}

impl FileHandle {
    fn new(metadata: AudioMetadata, preloaded: StereoBuffer) -> Self {
        Self {
            metadata,
            preloaded,
            full: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The resident prefix of the file.
    pub fn preloaded(&self) -> &StereoBuffer {
        &self.preloaded
    }

    /// The full file, once a loader thread published it.
    pub fn full_data(&self) -> Option<&StereoBuffer> {
        let pointer = self.full.load(Ordering::Acquire);
        if pointer.is_null() {
            None
        } else {
            // Published once, never replaced or freed before drop
            Some(unsafe { &*pointer })
        }
    }

    /// True when the whole file already sits in the preloaded prefix.
    pub fn fully_preloaded(&self) -> bool {
        self.preloaded.num_frames() as u32 >= self.metadata.total_frames
    }

    fn publish_full(&self, data: StereoBuffer) {
        let boxed = Box::into_raw(Box::new(data));
        if self
            .full
            .compare_exchange(ptr::null_mut(), boxed, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            // Someone else already published; drop the duplicate
            drop(unsafe { Box::from_raw(boxed) });
        }
    }

    /// Drops the streamed buffer again. Only the pool calls this, with
    /// no other user of the handle left.
    fn drop_full(&self) {
        let pointer = self.full.swap(ptr::null_mut(), Ordering::AcqRel);
        if !pointer.is_null() {
            drop(unsafe { Box::from_raw(pointer) });
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.drop_full();
    }
}

/// One streaming request from a voice.
struct StreamRequest {
    handle: Arc<FileHandle>,
    path: PathBuf,
    oversampling: u32,
}

struct CacheEntry {
    handle: Arc<FileHandle>,
    last_used: Instant,
}

/// The sample cache with its background loaders.
pub struct FilePool {
    reader: Arc<dyn AudioReader>,
    root_directory: PathBuf,
    preload_size: u32,
    oversampling: u32,

    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
    last_sweep: Mutex<Instant>,

    sender: Option<Sender<StreamRequest>>,
    workers: Vec<JoinHandle<()>>,
}

impl FilePool {
    /// Creates a pool with the default WAV reader and running loaders.
    pub fn new() -> Self {
        Self::with_reader(Arc::new(WavFileReader))
    }

    /// Creates a pool over a custom reader.
    pub fn with_reader(reader: Arc<dyn AudioReader>) -> Self {
        let mut pool = Self {
            reader,
            root_directory: PathBuf::new(),
            preload_size: config::DEFAULT_PRELOAD_SIZE,
            oversampling: 1,
            cache: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
            sender: None,
            workers: Vec::new(),
        };
        pool.set_active(true);
        pool
    }

    /// Base directory sample paths resolve against.
    pub fn set_root_directory(&mut self, directory: impl Into<PathBuf>) {
        self.root_directory = directory.into();
    }

    /// Frames kept resident per file. Takes effect on the next preload.
    pub fn set_preload_size(&mut self, preload_size: u32) {
        self.preload_size = preload_size;
        self.clear();
    }

    pub fn preload_size(&self) -> u32 {
        self.preload_size
    }

    /// Internal oversampling factor; cached data is resampled on load.
    pub fn set_oversampling(&mut self, factor: u32) {
        if matches!(factor, 1 | 2 | 4 | 8) && factor != self.oversampling {
            self.oversampling = factor;
            self.clear();
        }
    }

    pub fn oversampling(&self) -> u32 {
        self.oversampling
    }

    /// Starts or drains the loader threads.
    ///
    /// Deactivation is synchronous: pending requests finish before this
    /// returns, so a host `deactivate` leaves no thread behind.
    pub fn set_active(&mut self, active: bool) {
        if active && self.sender.is_none() {
            let (sender, receiver) = bounded::<StreamRequest>(LOADING_QUEUE_CAPACITY);
            self.sender = Some(sender);
            for index in 0..NUM_LOADING_THREADS {
                let receiver: Receiver<StreamRequest> = receiver.clone();
                let reader = Arc::clone(&self.reader);
                let builder =
                    std::thread::Builder::new().name(format!("forzando-loader-{}", index));
                let worker = builder.spawn(move || loading_thread(receiver, reader));
                match worker {
                    Ok(handle) => self.workers.push(handle),
                    Err(error) => warn!("could not spawn loader thread: {}", error),
                }
            }
        } else if !active && self.sender.is_some() {
            self.sender = None;
            for worker in self.workers.drain(..) {
                let _ = worker.join();
            }
        }
    }

    /// True while loader threads are running.
    pub fn is_active(&self) -> bool {
        self.sender.is_some()
    }

    fn resolve(&self, sample_path: &Path) -> PathBuf {
        if sample_path.is_absolute() {
            sample_path.to_path_buf()
        } else {
            self.root_directory.join(sample_path)
        }
    }

    /// Synchronously loads the preload prefix of a file and returns its
    /// shared handle. Repeated requests for the same path share one
    /// handle.
    pub fn preload(&self, sample_path: &Path) -> Result<Arc<FileHandle>, FilePoolError> {
        let resolved = self.resolve(sample_path);

        if let Ok(mut cache) = self.cache.lock() {
            if let Some(entry) = cache.get_mut(&resolved) {
                entry.last_used = Instant::now();
                return Ok(Arc::clone(&entry.handle));
            }
        }

        let max_frames = if self.preload_size == 0 {
            u32::MAX
        } else {
            self.preload_size
        };
        let (mut metadata, mut preloaded) = self.reader.read_frames(&resolved, max_frames)?;

        if self.oversampling > 1 {
            preloaded = upsample(&preloaded, self.oversampling);
            metadata = scale_metadata(metadata, self.oversampling);
        }

        let handle = Arc::new(FileHandle::new(metadata, preloaded));
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                resolved,
                CacheEntry {
                    handle: Arc::clone(&handle),
                    last_used: Instant::now(),
                },
            );
        }

        Ok(handle)
    }

    /// Enqueues a background load of the file's full data.
    ///
    /// Called from the audio thread; never blocks. A full queue is a
    /// recoverable error, the voice keeps playing from the prefix.
    pub fn enqueue_streaming(
        &self,
        handle: &Arc<FileHandle>,
        sample_path: &Path,
    ) -> Result<(), FilePoolError> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(FilePoolError::QueueFull);
        };

        if handle.full_data().is_some() || handle.fully_preloaded() {
            return Ok(());
        }

        let request = StreamRequest {
            handle: Arc::clone(handle),
            path: self.resolve(sample_path),
            oversampling: self.oversampling,
        };

        match sender.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                warn!("streaming queue full, {} keeps its prefix", sample_path.display());
                Err(FilePoolError::QueueFull)
            }
        }
    }

    /// Evicts idle entries. Cheap to call every block: returns without
    /// the cache lock when the clearing period has not elapsed, and
    /// never blocks on a contended lock.
    pub fn garbage_collect(&self) {
        {
            let Ok(mut last_sweep) = self.last_sweep.try_lock() else {
                return;
            };
            if last_sweep.elapsed() < Duration::from_secs(config::FILE_CLEARING_PERIOD_SECONDS) {
                return;
            }
            *last_sweep = Instant::now();
        }

        let Ok(mut cache) = self.cache.try_lock() else {
            return;
        };
        let threshold = Duration::from_secs(config::FILE_CLEARING_PERIOD_SECONDS);
        cache.retain(|path, entry| {
            let idle = entry.last_used.elapsed() >= threshold;
            let unused = Arc::strong_count(&entry.handle) == 1;
            if idle && unused {
                debug!("evicting idle sample {}", path.display());
                false
            } else {
                true
            }
        });
    }

    /// Drops every cache entry.
    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Number of cached files.
    pub fn cached_files(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }
}

impl Default for FilePool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FilePool {
    fn drop(&mut self) {
        self.set_active(false);
    }
}

fn loading_thread(receiver: Receiver<StreamRequest>, reader: Arc<dyn AudioReader>) {
    while let Ok(request) = receiver.recv() {
        if request.handle.full_data().is_some() {
            continue;
        }

        debug!("background loading {}", request.path.display());
        match reader.read_frames(&request.path, u32::MAX) {
            Ok((_, mut data)) => {
                if request.oversampling > 1 {
                    data = upsample(&data, request.oversampling);
                }
                request.handle.publish_full(data);
            }
            Err(error) => {
                // The voice keeps playing its prefix; nothing to unwind
                warn!("background load failed for {}: {}", request.path.display(), error);
            }
        }
    }
}

fn scale_metadata(metadata: AudioMetadata, factor: u32) -> AudioMetadata {
    AudioMetadata {
        total_frames: metadata.total_frames.saturating_mul(factor),
        sample_rate: metadata.sample_rate * factor as f64,
        loop_begin: metadata.loop_begin.map(|frame| frame.saturating_mul(factor)),
        loop_end: metadata.loop_end.map(|frame| frame.saturating_mul(factor)),
        ..metadata
    }
}

/// Upsamples a buffer by an integer factor with Hermite interpolation.
fn upsample(source: &StereoBuffer, factor: u32) -> StereoBuffer {
    let source_frames = source.num_frames();
    let factor = factor as usize;
    let mut output = StereoBuffer::new(source_frames * factor);

    for channel in 0..2 {
        let input = if channel == 0 { source.left() } else { source.right() };
        let window_at = |index: isize| -> f32 {
            let clamped = index.clamp(0, source_frames.max(1) as isize - 1) as usize;
            input.get(clamped).copied().unwrap_or(0.0)
        };

        let out = if channel == 0 {
            output.left_mut()
        } else {
            output.right_mut()
        };
        for (frame, sample) in out.iter_mut().enumerate() {
            let position = frame as f32 / factor as f32;
            let index = position as isize;
            let frac = position - index as f32;
            let window = [
                window_at(index - 1),
                window_at(index),
                window_at(index + 1),
                window_at(index + 2),
            ];
            *sample = interpolate(InterpolatorModel::Hermite3, &window, frac);
        }
    }

    output
}
