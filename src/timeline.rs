use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{ChannelVolumes, DEFAULT_TEMPO, PlayerConfig};
use crate::error::PipelineError;
use crate::midi::{EventKind, EventStream, StreamEvent};

/// Programs from here up are percussion voices; channels switched to one
/// are silenced until they get a melodic program again.
const PERCUSSION_PROGRAM_START: u8 = 112;
const VOLUME_CONTROLLER: u8 = 7;

/// One performance event after extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    /// MIDI channel 1-16.
    pub channel: u8,
    /// Start, in milliseconds from the beginning of the performance.
    pub start: i64,
    /// MIDI note number.
    pub key: u8,
    /// Sounding time in milliseconds. Zero marks a cancelled note.
    pub duration: i64,
    /// 0.0 - 1.0, already scaled by the channel volume.
    pub velocity: f64,
}

impl Note {
    pub fn end(&self) -> i64 {
        self.start + self.duration
    }

    pub fn is_cancelled(&self) -> bool {
        self.duration <= 0
    }
}

/// The extracted performance.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    /// Ordered by start time.
    pub notes: Vec<Note>,
    /// Track names, keyed by the channel they were attributed to.
    pub channel_names: BTreeMap<u8, String>,
    /// First tempo found in the file, if any.
    pub detected_tempo: Option<f64>,
    pub(crate) dynamics_applied: bool,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub tempo: f64,
    /// Ignore tempo events and stick to `tempo`.
    pub tempo_pinned: bool,
    pub volumes: ChannelVolumes,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            tempo: DEFAULT_TEMPO,
            tempo_pinned: false,
            volumes: ChannelVolumes::default(),
        }
    }
}

impl From<&PlayerConfig> for ExtractOptions {
    fn from(config: &PlayerConfig) -> Self {
        Self {
            tempo: config.tempo.unwrap_or(DEFAULT_TEMPO),
            tempo_pinned: config.tempo.is_some(),
            volumes: config.volumes,
        }
    }
}

/// Running state of a single extraction pass.
struct Extractor<'a> {
    stream: &'a EventStream,
    tempo_pinned: bool,
    ms_per_tick: f64,
    clock_ms: i64,
    last_tick: u64,
    volumes: ChannelVolumes,
    timeline: Timeline,
}

impl<'a> Extractor<'a> {
    fn new(stream: &'a EventStream, options: &ExtractOptions) -> Self {
        Self {
            stream,
            tempo_pinned: options.tempo_pinned,
            ms_per_tick: ms_per_tick(options.tempo, stream.ticks_per_beat),
            clock_ms: 0,
            last_tick: 0,
            volumes: options.volumes,
            timeline: Timeline::default(),
        }
    }

    fn run(mut self) -> Timeline {
        let stream = self.stream;
        for (index, event) in stream.events.iter().enumerate() {
            // The gap up to this event elapsed under the previous tempo
            let delta = event.tick.saturating_sub(self.last_tick);
            self.clock_ms += round_ms(delta as f64 * self.ms_per_tick);
            self.last_tick = event.tick;

            match &event.kind {
                EventKind::Tempo { micros_per_beat } => self.tempo_change(*micros_per_beat),
                EventKind::ProgramChange { program } => self.program_change(event.channel, *program),
                EventKind::Controller { controller, value } => {
                    self.controller(event.channel, *controller, *value)
                }
                EventKind::TrackName(name) => self.track_name(event, name),
                EventKind::NoteOn { key, velocity } => self.note_on(index, event, *key, *velocity),
                EventKind::NoteOff { .. } | EventKind::Other => {}
            }
        }

        // Merged streams are ordered already; sorting keeps that a guarantee
        self.timeline.notes.sort_by_key(|note| note.start);
        self.timeline
    }

    fn tempo_change(&mut self, micros_per_beat: u32) {
        if micros_per_beat == 0 {
            return;
        }
        let tempo = 60_000_000.0 / micros_per_beat as f64;
        if self.timeline.detected_tempo.is_none() {
            self.timeline.detected_tempo = Some(tempo);
            log::info!("Tempo: {:.0}/min", tempo);
        }
        if self.tempo_pinned {
            log::debug!("Ignoring tempo change to {:.1}/min (tempo pinned)", tempo);
            return;
        }
        self.ms_per_tick = ms_per_tick(tempo, self.stream.ticks_per_beat);
    }

    fn program_change(&mut self, channel: Option<u8>, program: u8) {
        let Some(channel) = channel else { return };
        let volume = self.volumes.get(channel);
        if volume == 0 {
            return;
        }
        if program >= PERCUSSION_PROGRAM_START {
            self.volumes.set(channel, -volume.abs());
        } else {
            self.volumes.set(channel, volume.abs());
        }
    }

    fn controller(&mut self, channel: Option<u8>, controller: u8, value: u8) {
        let Some(channel) = channel else { return };
        if controller == VOLUME_CONTROLLER && self.volumes.get(channel) > 0 {
            self.volumes.set(channel, (value as i32 * 10 / 127) as i8);
        }
    }

    fn track_name(&mut self, event: &StreamEvent, name: &str) {
        let channel = self
            .stream
            .events
            .iter()
            .filter(|other| other.track == event.track)
            .find_map(|other| other.channel);
        match channel {
            Some(channel) => {
                log::info!("Channel {}: {}", channel, name);
                self.timeline.channel_names.insert(channel, name.to_string());
            }
            None => log::info!("Track {} (no channel): {}", event.track, name),
        }
    }

    fn note_on(&mut self, index: usize, event: &StreamEvent, key: u8, velocity: u8) {
        let Some(channel) = event.channel else { return };
        let volume = self.volumes.get(channel);
        if volume <= 0 {
            return;
        }

        let note_off = self.stream.events[index + 1..].iter().find(|other| {
            other.track == event.track && matches!(other.kind, EventKind::NoteOff { key: k } if k == key)
        });
        let Some(note_off) = note_off else {
            log::debug!("Dropping unterminated note {} on channel {}", key, channel);
            return;
        };

        let duration = round_ms((note_off.tick - event.tick) as f64 * self.ms_per_tick);
        if duration <= 0 {
            return;
        }
        self.timeline.notes.push(Note {
            channel,
            start: self.clock_ms,
            key,
            duration,
            velocity: velocity as f64 * volume as f64 / 1270.0,
        });
    }
}

fn ms_per_tick(tempo: f64, ticks_per_beat: u16) -> f64 {
    60_000.0 / tempo / ticks_per_beat as f64
}

/// Half-up rounding used for both clock accumulation and note durations.
fn round_ms(ms: f64) -> i64 {
    (ms + 0.5).floor() as i64
}

/// Turns the event stream into a time-ordered list of notes.
///
/// A stream that yields no note at all is an error: there is nothing to play.
pub fn extract(stream: &EventStream, options: &ExtractOptions, source: &Path) -> Result<Timeline, PipelineError> {
    let timeline = Extractor::new(stream, options).run();
    if timeline.notes.is_empty() {
        return Err(PipelineError::Extraction(source.to_path_buf()));
    }
    log::info!("Loaded {} notes", timeline.notes.len());
    Ok(timeline)
}
