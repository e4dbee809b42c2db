use std::fmt;

use crate::organ::{KEY_COUNT, KeyTable, Pipe, PipeId};

/// Lowest sounding pitch used when no alignment scores anything.
pub const DEFAULT_BASENOTE: u8 = 43;

/// Assignment stages, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Direct,
    Octaves,
    Fifths,
    Thirds,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Direct => "Without harmonics",
            Stage::Octaves => "With octaves",
            Stage::Fifths => "With fifths",
            Stage::Thirds => "With thirds",
        };
        f.write_str(label)
    }
}

/// Outcome of mapping the pipes onto the keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Pitch sounded by the pipe with offset 0.
    pub basenote: u8,
    /// Percentage of the weight playable after each stage.
    pub coverage: Vec<(Stage, f64)>,
}

impl Assignment {
    pub fn final_coverage(&self) -> f64 {
        self.coverage.last().map_or(0.0, |(_, c)| *c)
    }
}

/// Sum of the weights the pipes would cover with their lowest one on `base`.
fn alignment_score(keys: &KeyTable, offsets: &[u8], base: usize) -> f64 {
    offsets
        .iter()
        .map(|&offset| base + offset as usize)
        .filter(|&key| key < KEY_COUNT)
        .map(|key| keys.weight(key))
        .sum()
}

/// Finds the base pitch that puts the most weight on real pipes.
/// The lowest base wins a tie.
pub fn best_basenote(keys: &KeyTable, offsets: &[u8]) -> u8 {
    let mut basenote = DEFAULT_BASENOTE;
    let mut best = 0.0;
    for base in 0..KEY_COUNT - 1 {
        let score = alignment_score(keys, offsets, base);
        if score > best {
            best = score;
            basenote = base as u8;
        }
    }
    basenote
}

/// Copies each key's pipe to the key `interval` semitones away, where that
/// key has none yet. Upward intervals scan ascending, downward ones
/// descending, so a pipe can travel several octaves in one pass.
fn fold(keys: &mut KeyTable, interval: i32) {
    let span = interval.unsigned_abs() as usize;
    let sources: Box<dyn Iterator<Item = usize>> = if interval > 0 {
        Box::new(0..KEY_COUNT - span)
    } else {
        Box::new((span..KEY_COUNT).rev())
    };
    for source in sources {
        let target = (source as i32 + interval) as usize;
        if let Some(pipe) = keys.pipe_for(source as u8) {
            keys.assign_if_free(target, pipe);
        }
    }
}

/// Maps `pipes` onto `keys`: best alignment first, then harmonic folding
/// (octaves up and down, fifths, then a third plus an octave).
pub fn assign(keys: &mut KeyTable, pipes: &[Pipe]) -> Assignment {
    let offsets: Vec<u8> = pipes.iter().map(|p| p.offset).collect();
    let basenote = best_basenote(keys, &offsets);

    for (index, &offset) in offsets.iter().enumerate() {
        let key = basenote as usize + offset as usize;
        if key < KEY_COUNT && !keys.assign_if_free(key, PipeId(index)) {
            log::debug!("Pipe {:02} shares key {} with an earlier pipe", offset, key);
        }
    }

    let mut coverage = Vec::with_capacity(4);
    let mut record = |keys: &KeyTable, stage: Stage| {
        let percent = keys.coverage();
        log::info!("{}: {:.1}% notes can be played", stage, percent);
        coverage.push((stage, percent));
    };

    record(&*keys, Stage::Direct);
    fold(keys, 12);
    fold(keys, -12);
    record(&*keys, Stage::Octaves);
    fold(keys, 7);
    record(&*keys, Stage::Fifths);
    fold(keys, 16);
    record(&*keys, Stage::Thirds);

    log::info!("Lowest pipe plays note {}", basenote);
    Assignment { basenote, coverage }
}
