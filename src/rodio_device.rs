use crate::device::PlaybackDevice;
use crate::error::{Error, Result};
use lofty::file::AudioFile;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sound-card output through rodio.
///
/// The play queue is a list of files; `play` decodes the whole queue into a
/// fresh sink. Not `Send`: keep it on the thread that created it.
pub struct RodioDevice {
    _stream: OutputStream,
    stream_handle: OutputStreamHandle,
    sink: Option<Sink>,
    queue: Vec<PathBuf>,
    volume: u8,
}

impl RodioDevice {
    /// Open the default audio output.
    pub fn new() -> Result<Self> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| Error::device(format!("Failed to open audio output: {}", e)))?;
        Ok(RodioDevice {
            _stream: stream,
            stream_handle: handle,
            sink: None,
            queue: Vec::new(),
            volume: 100,
        })
    }

    fn start_sink(&mut self) -> Result<()> {
        let sink = Sink::try_new(&self.stream_handle)
            .map_err(|e| Error::device(format!("Failed to create audio sink: {}", e)))?;
        sink.set_volume(self.volume as f32 / 100.0);
        for path in &self.queue {
            let file = File::open(path)
                .map_err(|e| Error::device(format!("Cannot open '{}': {}", path.display(), e)))?;
            let source = Decoder::new(BufReader::new(file))
                .map_err(|e| Error::device(format!("Cannot decode '{}': {}", path.display(), e)))?;
            sink.append(source);
        }
        sink.play();
        self.sink = Some(sink);
        Ok(())
    }

    /// Index into `queue` of the song the sink is on.
    fn current_index(&self) -> Option<usize> {
        let sink = self.sink.as_ref()?;
        if sink.empty() {
            return None;
        }
        self.queue.len().checked_sub(sink.len())
    }

    fn current_song(&self) -> Option<&Path> {
        self.current_index()
            .and_then(|i| self.queue.get(i))
            .map(|p| p.as_path())
    }
}

impl PlaybackDevice for RodioDevice {
    fn play(&mut self) -> Result<()> {
        if let Some(sink) = &self.sink {
            if !sink.empty() {
                sink.play();
                return Ok(());
            }
        }
        if self.queue.is_empty() {
            return Ok(());
        }
        self.start_sink()
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if let Some(sink) = &self.sink {
            sink.pause();
        }
        Ok(())
    }

    fn playing(&mut self) -> Result<bool> {
        Ok(self
            .sink
            .as_ref()
            .is_some_and(|s| !s.empty() && !s.is_paused()))
    }

    fn paused(&mut self) -> Result<bool> {
        Ok(self
            .sink
            .as_ref()
            .is_some_and(|s| !s.empty() && s.is_paused()))
    }

    fn queue_clear(&mut self) -> Result<()> {
        self.stop()?;
        self.queue.clear();
        Ok(())
    }

    /// `.m3u`/`.m3u8` playlists are expanded to their entries.
    fn queue_add(&mut self, path: &Path) -> Result<()> {
        if is_playlist(path) {
            let entries = read_m3u(path)?;
            tracing::debug!(playlist = %path.display(), entries = entries.len(), "Queued playlist");
            self.queue.extend(entries);
        } else {
            self.queue.push(path.to_path_buf());
        }
        Ok(())
    }

    fn queue_length(&mut self) -> Result<i32> {
        Ok(self.queue.len() as i32)
    }

    fn song_position_ms(&mut self) -> Result<i64> {
        Ok(self
            .sink
            .as_ref()
            .map(|s| s.get_pos().as_millis() as i64)
            .unwrap_or(0))
    }

    fn song_path(&mut self) -> Result<String> {
        Ok(self
            .current_song()
            .or_else(|| self.queue.first().map(|p| p.as_path()))
            .map(|p| p.display().to_string())
            .unwrap_or_default())
    }

    fn set_volume(&mut self, percent: u8, verbose: bool) -> Result<()> {
        self.volume = percent.min(100);
        if let Some(sink) = &self.sink {
            sink.set_volume(self.volume as f32 / 100.0);
        }
        if verbose {
            tracing::info!(volume = self.volume, "Volume set");
        }
        Ok(())
    }

    fn get_volume(&mut self) -> Result<u8> {
        Ok(self.volume)
    }

    fn song_remaining_ms(&mut self) -> Result<Option<i64>> {
        let Some(path) = self.current_song().map(|p| p.to_path_buf()) else {
            return Ok(None);
        };
        let total = track_length(&path)?;
        let position = self.song_position_ms()?;
        Ok(Some((total.as_millis() as i64 - position).max(0)))
    }

    fn restart(&mut self) -> Result<()> {
        self.queue_clear()?;
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| Error::device(format!("Failed to reopen audio output: {}", e)))?;
        self._stream = stream;
        self.stream_handle = handle;
        tracing::info!("Audio output reopened");
        Ok(())
    }
}

fn is_playlist(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("m3u") || e.eq_ignore_ascii_case("m3u8"))
}

/// Entries of an m3u playlist, relative paths resolved against its directory.
pub fn read_m3u(path: &Path) -> Result<Vec<PathBuf>> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::device(format!("Failed to read playlist '{}': {}", path.display(), e)))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut entries = Vec::new();
    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = if Path::new(line).is_absolute() {
            PathBuf::from(line)
        } else {
            base_dir.join(line)
        };
        entries.push(entry);
    }
    Ok(entries)
}

/// Track length from the file's audio properties.
pub fn track_length(path: &Path) -> Result<Duration> {
    let tagged_file = lofty::read_from_path(path)
        .map_err(|e| Error::DataIntegrity(format!("Failed to read '{}': {}", path.display(), e)))?;
    Ok(tagged_file.properties().duration())
}
