//! Headless controller for chipstream.
//!
//! Owns a parsed module and provides the operations the CLI (or any other
//! frontend) needs: real-time playback on a background thread and offline
//! WAV rendering. The engine stream itself stays single-threaded — the
//! playback thread owns it outright and feeds decoded frames into the
//! audio ring buffer.

mod wav;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chip_audio::{AudioOutput, CpalOutput, Frame};
use chip_engine::{LoadModuleConfig, Stream};
use chip_ir::Module;

// Re-export common types so frontends don't need the lower crates directly.
pub use chip_engine::{LoadError, StreamEvent};
pub use chip_formats::FormatError;
pub use wav::{pcm_to_wav, write_wav};

const SAMPLE_RATE: u32 = 44100;

/// Loading errors: the file parser's or the module compiler's.
#[derive(Debug)]
pub enum Error {
    Format(FormatError),
    Load(LoadError),
    /// An operation that needs a module ran before `load_xm`
    NoModule,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Format(e) => write!(f, "parse module: {}", e),
            Error::Load(e) => write!(f, "load module: {}", e),
            Error::NoModule => write!(f, "no module loaded"),
        }
    }
}

impl std::error::Error for Error {}

impl From<FormatError> for Error {
    fn from(e: FormatError) -> Self {
        Error::Format(e)
    }
}

impl From<LoadError> for Error {
    fn from(e: LoadError) -> Self {
        Error::Load(e)
    }
}

/// Headless player — owns a module and manages playback.
pub struct Controller {
    module: Option<Module>,
    config: LoadModuleConfig,
    volume: f64,
    looping: bool,
    playback: Option<PlaybackHandle>,
}

struct PlaybackHandle {
    stop_signal: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    /// Playback position in seconds, stored as f64 bits
    position: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new() -> Self {
        Self {
            module: None,
            config: LoadModuleConfig::default(),
            volume: 0.8,
            looping: false,
            playback: None,
        }
    }

    // --- Module management ---

    /// Parse an XM file image and verify it compiles for playback.
    pub fn load_xm(&mut self, data: &[u8]) -> Result<(), Error> {
        self.stop();
        let module = chip_formats::load_xm(data)?;
        // Compile once up front so load errors surface here, not on the
        // playback thread.
        Stream::new().load_module(&module, self.config)?;
        self.module = Some(module);
        Ok(())
    }

    pub fn module(&self) -> Option<&Module> {
        self.module.as_ref()
    }

    /// Set the load configuration used for subsequent playback/render calls.
    pub fn set_config(&mut self, config: LoadModuleConfig) {
        self.config = config;
    }

    /// Global volume scaling in [0, 1].
    pub fn set_volume(&mut self, volume: f64) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    /// Loop playback instead of stopping at the song end.
    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Heap footprint of the compiled module, in bytes.
    pub fn memory_usage(&self) -> Result<usize, Error> {
        let stream = self.make_stream()?;
        Ok(stream.memory_usage())
    }

    // --- Real-time playback ---

    /// Start playback on a background thread. Any previous playback stops.
    pub fn play(&mut self) -> Result<(), Error> {
        self.stop();

        let mut stream = self.make_stream()?;
        let stop_signal = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let position = Arc::new(AtomicU64::new(0));

        let stop = stop_signal.clone();
        let done = finished.clone();
        let pos = position.clone();

        let thread = std::thread::spawn(move || {
            audio_thread(&mut stream, &stop, &pos);
            done.store(true, Ordering::Relaxed);
        });

        self.playback = Some(PlaybackHandle {
            stop_signal,
            finished,
            position,
            thread: Some(thread),
        });
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut pb) = self.playback.take() {
            pb.stop_signal.store(true, Ordering::Relaxed);
            if let Some(handle) = pb.thread.take() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playback
            .as_ref()
            .is_some_and(|p| !p.finished.load(Ordering::Relaxed))
    }

    /// Playback position in seconds, while playing.
    pub fn position(&self) -> Option<f64> {
        let pb = self.playback.as_ref()?;
        if pb.finished.load(Ordering::Relaxed) {
            return None;
        }
        Some(f64::from_bits(pb.position.load(Ordering::Relaxed)))
    }

    // --- Offline rendering ---

    /// Render up to `max_seconds` of playback as raw PCM bytes.
    pub fn render_pcm(&self, max_seconds: u32) -> Result<Vec<u8>, Error> {
        let mut stream = self.make_stream()?;
        let max_bytes = SAMPLE_RATE as usize * 4 * max_seconds as usize;
        let chunk = stream.info().bytes_per_tick.max(4096) * 8;

        let mut pcm = Vec::new();
        let mut buf = vec![0u8; chunk];
        while pcm.len() < max_bytes {
            let n = stream.read(&mut buf);
            if n == 0 {
                break;
            }
            let take = n.min(max_bytes - pcm.len());
            pcm.extend_from_slice(&buf[..take]);
        }
        Ok(pcm)
    }

    /// Render up to `max_seconds` of playback as a WAV image.
    pub fn render_to_wav(&self, max_seconds: u32) -> Result<Vec<u8>, Error> {
        let pcm = self.render_pcm(max_seconds)?;
        Ok(wav::pcm_to_wav(&pcm, SAMPLE_RATE))
    }

    fn make_stream(&self) -> Result<Stream, Error> {
        let module = self.module.as_ref().ok_or(Error::NoModule)?;
        let mut stream = Stream::new();
        stream.load_module(module, self.config)?;
        stream.set_volume(self.volume);
        stream.set_looping(self.looping);
        Ok(stream)
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

fn audio_thread(stream: &mut Stream, stop_signal: &AtomicBool, position: &AtomicU64) {
    let Ok((mut output, consumer)) = CpalOutput::new(SAMPLE_RATE) else {
        return;
    };
    if output.build_stream(consumer).is_err() {
        return;
    }
    if output.start().is_err() {
        return;
    }

    let bytes_per_second = SAMPLE_RATE as u64 * 4;
    let mut buf = vec![0u8; stream.info().bytes_per_tick.max(4096) * 4];
    let mut total_bytes: u64 = 0;

    loop {
        if stop_signal.load(Ordering::Relaxed) {
            break;
        }
        let n = stream.read(&mut buf);
        if n == 0 {
            break;
        }
        for frame in buf[..n].chunks_exact(4) {
            output.write_spin(Frame::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]));
        }
        total_bytes += n as u64;
        let seconds = total_bytes as f64 / bytes_per_second as f64;
        position.store(seconds.to_bits(), Ordering::Relaxed);
    }

    // Push a short silent tail so the ring buffer drains audibly.
    for _ in 0..SAMPLE_RATE / 4 {
        output.write_spin(Frame::silence());
    }
    let _ = output.stop();
}
