use midly::{MetaMessage, MidiMessage as MidlyMidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::fs;
use std::path::Path;

use crate::error::PipelineError;

/// Converts a MIDI note number to its name (e.g., 60 -> "C4").
pub fn midi_note_to_name(note: u8) -> String {
    const NOTES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    let octave = (note / 12) as i8 - 1; // MIDI note 0 is C-1
    let note_name = NOTES[(note % 12) as usize];
    format!("{}{}", note_name, octave)
}

/// What a single stream event means to the extractor.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    NoteOn { key: u8, velocity: u8 },
    /// Also produced for a note-on with velocity 0.
    NoteOff { key: u8 },
    Controller { controller: u8, value: u8 },
    ProgramChange { program: u8 },
    Tempo { micros_per_beat: u32 },
    TrackName(String),
    Other,
}

/// One event of the joined, time-ordered stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    /// Absolute position in ticks.
    pub tick: u64,
    /// Index of the SMF track the event came from.
    pub track: usize,
    /// MIDI channel 1-16, `None` for meta and sysex events.
    pub channel: Option<u8>,
    pub kind: EventKind,
}

/// All tracks of a MIDI file flattened into a single list, ordered by tick.
#[derive(Debug, Clone)]
pub struct EventStream {
    pub ticks_per_beat: u16,
    pub events: Vec<StreamEvent>,
}

/// Reads and decodes a MIDI file.
pub fn load_event_stream(path: &Path) -> Result<EventStream, PipelineError> {
    let data = fs::read(path).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let smf = Smf::parse(&data).map_err(|e| PipelineError::Midi(e.to_string()))?;
    EventStream::from_smf(&smf)
}

impl EventStream {
    /// Joins the tracks of `smf`, always taking the track with the earliest
    /// pending event. Ties go to the lower track index.
    pub fn from_smf(smf: &Smf) -> Result<Self, PipelineError> {
        let ticks_per_beat = match smf.header.timing {
            Timing::Metrical(t) => t.as_int(),
            Timing::Timecode(_, _) => {
                return Err(PipelineError::Midi(
                    "Unsupported MIDI timing format (must be Metrical/TPQN)".into(),
                ));
            }
        };
        if ticks_per_beat == 0 {
            return Err(PipelineError::Midi("ticks per beat is zero".into()));
        }

        let mut tracks: Vec<_> = smf.tracks.iter().map(|track| track.iter().peekable()).collect();
        // Absolute tick of the last consumed event in each track
        let mut track_times: Vec<u64> = vec![0; tracks.len()];
        let mut events = Vec::with_capacity(smf.tracks.iter().map(|t| t.len()).sum());

        loop {
            let mut next_tick = u64::MAX;
            let mut next_track = None;

            for (i, track_iter) in tracks.iter_mut().enumerate() {
                if let Some(event) = track_iter.peek() {
                    let event_time = track_times[i] + event.delta.as_int() as u64;
                    if event_time < next_tick {
                        next_tick = event_time;
                        next_track = Some(i);
                    }
                }
            }

            let Some(track_idx) = next_track else {
                break; // All tracks are finished
            };
            let Some(event) = tracks[track_idx].next() else {
                break;
            };
            track_times[track_idx] = next_tick;
            events.push(convert_event(event, next_tick, track_idx));
        }

        Ok(Self { ticks_per_beat, events })
    }
}

fn convert_event(event: &TrackEvent, tick: u64, track: usize) -> StreamEvent {
    let (channel, kind) = match event.kind {
        TrackEventKind::Midi { channel, message } => {
            let kind = match message {
                MidlyMidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => EventKind::NoteOn {
                    key: key.as_int(),
                    velocity: vel.as_int(),
                },
                MidlyMidiMessage::NoteOn { key, .. } | MidlyMidiMessage::NoteOff { key, .. } => {
                    EventKind::NoteOff { key: key.as_int() }
                }
                MidlyMidiMessage::Controller { controller, value } => EventKind::Controller {
                    controller: controller.as_int(),
                    value: value.as_int(),
                },
                MidlyMidiMessage::ProgramChange { program } => EventKind::ProgramChange {
                    program: program.as_int(),
                },
                _ => EventKind::Other,
            };
            (Some(channel.as_int() + 1), kind)
        }
        TrackEventKind::Meta(MetaMessage::Tempo(micros)) => (
            None,
            EventKind::Tempo {
                micros_per_beat: micros.as_int(),
            },
        ),
        TrackEventKind::Meta(MetaMessage::TrackName(name)) => {
            (None, EventKind::TrackName(String::from_utf8_lossy(name).into_owned()))
        }
        _ => (None, EventKind::Other),
    };
    StreamEvent { tick, track, channel, kind }
}
