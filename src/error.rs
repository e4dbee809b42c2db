use std::path::PathBuf;
use thiserror::Error;

/// Fatal conditions that stop a run before or during setup.
///
/// Scheduling drift is not in here: the scheduler recovers from it on its own.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad or missing command-line settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file could not be decoded as a Standard MIDI File.
    #[error("MIDI parse error: {0}")]
    Midi(String),

    /// The file decoded fine but held nothing playable.
    #[error("could not load any note from {}", .0.display())]
    Extraction(PathBuf),

    /// Hub unreachable, or no usable pipe behind it.
    #[error("hardware discovery failed: {0}")]
    HardwareDiscovery(String),
}
