use crate::organ::KeyTable;
use crate::timeline::{Note, Timeline};

/// Notes on one pipe closer than this are considered overlapping.
pub const GRACE_MS: i64 = 10;
/// A louder note arriving later than this after the sounding one re-strikes the pipe.
const RESTRIKE_MS: i64 = 20;

/// What conflict resolution changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resolution {
    pub shortened: usize,
    pub extended: usize,
    pub cancelled: usize,
}

/// Makes sure a pipe never has two overlapping notes.
///
/// For each note, later notes on the same pipe starting before it ends (plus
/// the grace window) are looked at in order. A clearly later and louder one
/// cuts the current note short and takes over its remaining sustain; anything
/// else is a duplicate and gets cancelled.
pub fn resolve(notes: &mut [Note], keys: &KeyTable) -> Resolution {
    let mut resolution = Resolution::default();

    for index in 0..notes.len() {
        let (head, tail) = notes.split_at_mut(index + 1);
        let note = &mut head[index];
        // A cancelled note never sounds, so it claims no pipe time
        if note.is_cancelled() {
            continue;
        }
        let Some(pipe) = keys.pipe_for(note.key) else {
            continue;
        };
        let original_end = note.end();

        let overlapping = tail
            .iter_mut()
            .take_while(|next| next.start < original_end + GRACE_MS)
            .filter(|next| !next.is_cancelled() && keys.pipe_for(next.key) == Some(pipe));

        for next in overlapping {
            if next.start > note.start + RESTRIKE_MS && next.velocity > note.velocity {
                note.duration = next.start - note.start - GRACE_MS;
                resolution.shortened += 1;
                if next.end() + RESTRIKE_MS < original_end {
                    next.duration = original_end - next.start;
                    resolution.extended += 1;
                }
                break;
            }
            next.duration = 0;
            resolution.cancelled += 1;
        }
    }

    log::info!(
        "Conflicts: {} notes shortened, {} extended, {} cancelled",
        resolution.shortened,
        resolution.extended,
        resolution.cancelled
    );
    resolution
}

impl Timeline {
    /// Shortens every note in proportion to its velocity, so the loudest note
    /// keeps its full length. Pipes can't play softer, only shorter.
    ///
    /// Runs at most once; returns false when it did nothing.
    pub fn apply_dynamics(&mut self) -> bool {
        if self.dynamics_applied {
            log::warn!("Dynamics already applied, skipping");
            return false;
        }
        let max_velocity = self.notes.iter().map(|n| n.velocity).fold(0.0, f64::max);
        if max_velocity <= 0.0 {
            return false;
        }
        for note in &mut self.notes {
            note.duration = (note.duration as f64 * note.velocity / max_velocity) as i64;
        }
        self.dynamics_applied = true;
        true
    }
}
