use std::ffi::OsString;
use std::path::PathBuf;

use crate::error::PipelineError;

/// Hub contacted when no `--ip` is given.
pub const DEFAULT_HUB_ADDRESS: &str = "192.168.1.71";
/// Tempo assumed until the file (or the command line) says otherwise.
pub const DEFAULT_TEMPO: f64 = 120.0;
/// Pipes named above this offset are ignored unless `--max` says otherwise.
pub const DEFAULT_MAX_OFFSET: u8 = 99;
/// Channel volume range used by `ch:vol` settings and controller 7.
pub const MAX_VOLUME: i8 = 10;
const DRUM_CHANNEL: usize = 10;

/// Per-channel volume, indexed 1-16 (slot 0 is unused).
///
/// A negative value means the channel is temporarily silenced because its
/// current program is a percussion voice; the magnitude is the volume.
/// Zero silences the channel for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelVolumes([i8; 17]);

impl Default for ChannelVolumes {
    /// Full volume everywhere except the GM drum channel.
    fn default() -> Self {
        let mut volumes = [MAX_VOLUME; 17];
        volumes[0] = 0;
        volumes[DRUM_CHANNEL] = 0;
        Self(volumes)
    }
}

impl ChannelVolumes {
    pub fn get(&self, channel: u8) -> i8 {
        self.0.get(channel as usize).copied().unwrap_or(0)
    }

    pub fn set(&mut self, channel: u8, volume: i8) {
        if let Some(slot) = self.0.get_mut(channel as usize) {
            *slot = volume.clamp(-MAX_VOLUME, MAX_VOLUME);
        }
    }
}

/// Everything a run needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub midi_file: PathBuf,
    /// Tempo pinned with `@<tempo>`; tempo events in the file are then ignored.
    pub tempo: Option<f64>,
    pub volumes: ChannelVolumes,
    pub hub_address: String,
    pub dynamics: bool,
    pub dry_run: bool,
    pub verbose: bool,
    pub max_offset: u8,
}

impl PlayerConfig {
    pub fn new(midi_file: PathBuf) -> Self {
        Self {
            midi_file,
            tempo: None,
            volumes: ChannelVolumes::default(),
            hub_address: DEFAULT_HUB_ADDRESS.to_string(),
            dynamics: false,
            dry_run: false,
            verbose: false,
            max_offset: DEFAULT_MAX_OFFSET,
        }
    }

    /// Applies one positional setting token: `@<tempo>` or `<channel>:<volume>`.
    pub fn apply_setting(&mut self, token: &str) -> Result<(), PipelineError> {
        if let Some(tempo) = token.strip_prefix('@') {
            let tempo: f64 = tempo
                .parse()
                .map_err(|_| PipelineError::Configuration(format!("invalid tempo '{}'", token)))?;
            if !(tempo.is_finite() && tempo > 0.0) {
                return Err(PipelineError::Configuration(format!("tempo must be positive, got '{}'", token)));
            }
            self.tempo = Some(tempo);
            return Ok(());
        }

        let Some((channel, volume)) = token.split_once(':') else {
            return Err(PipelineError::Configuration(format!(
                "unrecognized setting '{}' (expected @<tempo> or <channel>:<volume>)",
                token
            )));
        };
        let channel: u8 = channel
            .parse()
            .map_err(|_| PipelineError::Configuration(format!("invalid channel in '{}'", token)))?;
        let volume: f64 = volume
            .parse()
            .map_err(|_| PipelineError::Configuration(format!("invalid volume in '{}'", token)))?;

        if !(1..=16).contains(&channel) {
            log::warn!("Ignoring volume for channel {} (channels are 1-16)", channel);
            return Ok(());
        }
        self.volumes.set(channel, volume.clamp(0.0, MAX_VOLUME as f64) as i8);
        Ok(())
    }
}

/// Rewrites the single-dash flags of the old launcher (`-dyn`, `-ip:1.2.3.4`,
/// `-max:12`, ...) into their long forms so clap can parse them.
pub fn normalize_legacy_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let Some(text) = arg.to_str() else {
                return arg;
            };
            let rewritten = match text {
                "-dyn" | "-mute" | "-verbose" => Some(format!("-{}", text)),
                _ => text
                    .strip_prefix("-ip:")
                    .map(|addr| format!("--ip={}", addr))
                    .or_else(|| text.strip_prefix("-max:").map(|max| format!("--max={}", max))),
            };
            rewritten.map(OsString::from).unwrap_or(arg)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_volumes_mute_the_drum_channel() {
        let volumes = ChannelVolumes::default();
        assert_eq!(volumes.get(1), 10);
        assert_eq!(volumes.get(10), 0);
        assert_eq!(volumes.get(16), 10);
        assert_eq!(volumes.get(17), 0);
    }

    #[test]
    fn settings_tokens() {
        let mut config = PlayerConfig::new("song.mid".into());
        config.apply_setting("@90").unwrap();
        config.apply_setting("10:7").unwrap();
        config.apply_setting("3:0").unwrap();
        config.apply_setting("4:42").unwrap();
        assert_eq!(config.tempo, Some(90.0));
        assert_eq!(config.volumes.get(10), 7);
        assert_eq!(config.volumes.get(3), 0);
        assert_eq!(config.volumes.get(4), 10);
    }

    #[test]
    fn out_of_range_channel_is_ignored() {
        let mut config = PlayerConfig::new("song.mid".into());
        config.apply_setting("17:5").unwrap();
        assert_eq!(config.volumes, ChannelVolumes::default());
    }

    #[test]
    fn malformed_settings_are_configuration_errors() {
        let mut config = PlayerConfig::new("song.mid".into());
        for token in ["@fast", "@0", "loud", "x:3", "2:y"] {
            assert!(
                matches!(config.apply_setting(token), Err(PipelineError::Configuration(_))),
                "{} should be rejected",
                token
            );
        }
    }

    #[test]
    fn legacy_flags_are_rewritten() {
        let args = ["yocto-pipes", "song.mid", "@100", "-dyn", "-ip:10.0.0.2", "-max:12", "-verbose", "2:5"]
            .into_iter()
            .map(OsString::from);
        let normalized = normalize_legacy_args(args);
        assert_eq!(
            normalized,
            ["yocto-pipes", "song.mid", "@100", "--dyn", "--ip=10.0.0.2", "--max=12", "--verbose", "2:5"]
                .map(OsString::from)
        );
    }
}
