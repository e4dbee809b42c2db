use crate::error::PipelineError;
use crate::relay::{Relay, RelayHub};
use crate::timeline::Note;

/// Hardware limit of the pipe bank.
pub const MAX_PIPES: usize = 32;
pub const KEY_COUNT: usize = 128;
/// Relays driving a pipe are named `tune<offset>`, e.g. `tune07`.
const PIPE_NAME_PREFIX: &str = "tune";

/// Index of a pipe in the organ's pipe table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(pub usize);

/// One physical pipe and the relay that opens its valve.
#[derive(Debug)]
pub struct Pipe {
    pub relay: Box<dyn Relay>,
    /// Semitones above the organ's lowest pipe.
    pub offset: u8,
    /// Scheduler time (ms) until which the pipe is sounding.
    pub busy_until: i64,
}

impl Pipe {
    pub fn new(relay: Box<dyn Relay>, offset: u8) -> Self {
        Self {
            relay,
            offset,
            busy_until: 0,
        }
    }
}

/// One MIDI pitch slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Key {
    /// Total duration x velocity of all notes played at this pitch.
    pub weight: f64,
    pub pipe: Option<PipeId>,
}

/// The 128 keys plus the total weight used to report coverage.
#[derive(Debug, Clone)]
pub struct KeyTable {
    keys: [Key; KEY_COUNT],
    total_weight: f64,
}

impl KeyTable {
    /// Builds the usage histogram of `notes`.
    pub fn from_notes(notes: &[Note]) -> Self {
        let mut keys = [Key::default(); KEY_COUNT];
        for note in notes {
            if let Some(key) = keys.get_mut(note.key as usize) {
                key.weight += note.duration as f64 * note.velocity;
            }
        }
        let total_weight = keys.iter().map(|k| k.weight).sum();
        Self { keys, total_weight }
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn weight(&self, key: usize) -> f64 {
        self.keys.get(key).map_or(0.0, |k| k.weight)
    }

    pub fn pipe_for(&self, key: u8) -> Option<PipeId> {
        self.keys.get(key as usize).and_then(|k| k.pipe)
    }

    /// Assigns `pipe` to `key` unless the key already has one.
    /// Returns whether the assignment happened.
    pub fn assign_if_free(&mut self, key: usize, pipe: PipeId) -> bool {
        match self.keys.get_mut(key) {
            Some(slot) if slot.pipe.is_none() => {
                slot.pipe = Some(pipe);
                true
            }
            _ => false,
        }
    }

    /// Percentage of the total weight that lands on a key with a pipe.
    pub fn coverage(&self) -> f64 {
        if self.total_weight <= 0.0 {
            return 0.0;
        }
        let covered: f64 = self.keys.iter().filter(|k| k.pipe.is_some()).map(|k| k.weight).sum();
        100.0 * covered / self.total_weight
    }
}

/// Parses the pipe offset out of a relay name such as `tune07`.
/// Out-of-range offsets are returned as is, for the caller to drop.
pub fn parse_pipe_offset(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(PIPE_NAME_PREFIX)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Collects the pipes behind `hub`, in the order the hub lists its relays.
///
/// Relays not named like a pipe are skipped, pipes above `max_offset` are
/// dropped. An unreachable hub or an empty pipe set is fatal.
pub fn discover_pipes(hub: &dyn RelayHub, max_offset: u8) -> Result<Vec<Pipe>, PipelineError> {
    let relays = hub
        .relays()
        .map_err(|e| PipelineError::HardwareDiscovery(format!("{:#}", e)))?;

    let mut pipes = Vec::new();
    for relay in relays {
        let Some(offset) = parse_pipe_offset(relay.name()) else {
            log::debug!("Skipping relay '{}'", relay.name());
            continue;
        };
        let offset = match u8::try_from(offset) {
            Ok(offset) if offset <= max_offset => offset,
            _ => {
                log::info!("Dropping pipe {:02}", offset);
                continue;
            }
        };
        if pipes.len() == MAX_PIPES {
            log::warn!("More than {} pipes found, ignoring pipe {:02}", MAX_PIPES, offset);
            continue;
        }
        pipes.push(Pipe::new(relay, offset));
    }

    if pipes.is_empty() {
        return Err(PipelineError::HardwareDiscovery("no pipe found on the hub".into()));
    }
    log::info!("Found {} pipes", pipes.len());
    Ok(pipes)
}
