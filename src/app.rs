use crate::assign::{self, Assignment};
use crate::config::PlayerConfig;
use crate::conflict::{self, Resolution};
use crate::error::PipelineError;
use crate::midi::{self, EventStream};
use crate::organ::{self, KeyTable, Pipe};
use crate::relay::{RelayHub, YoctoHub};
use crate::scheduler::{Clock, PlaybackOptions, PlaybackReport, Scheduler, SystemClock};
use crate::timeline::{self, ExtractOptions, Timeline};

/// What one run did, stage by stage.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub notes: usize,
    pub assignment: Assignment,
    pub resolution: Resolution,
    pub playback: PlaybackReport,
}

impl From<&PlayerConfig> for PlaybackOptions {
    fn from(config: &PlayerConfig) -> Self {
        Self {
            dry_run: config.dry_run,
            verbose: config.verbose,
        }
    }
}

/// Plays the configured file on the configured hub, in real time.
pub fn run(config: &PlayerConfig) -> Result<RunSummary, PipelineError> {
    log::info!("Loading {}", config.midi_file.display());
    let stream = midi::load_event_stream(&config.midi_file)?;
    let hub = YoctoHub::connect(&config.hub_address)
        .map_err(|e| PipelineError::HardwareDiscovery(format!("{:#}", e)))?;
    play_stream(&stream, config, &hub, &SystemClock::new())
}

/// Extracts the notes of `stream`, finds the pipes behind `hub` and plays.
pub fn play_stream<C: Clock>(
    stream: &EventStream,
    config: &PlayerConfig,
    hub: &dyn RelayHub,
    clock: &C,
) -> Result<RunSummary, PipelineError> {
    let timeline = timeline::extract(stream, &ExtractOptions::from(config), &config.midi_file)?;
    let pipes = organ::discover_pipes(hub, config.max_offset)?;
    Ok(perform(timeline, pipes, config, clock))
}

/// Assignment, conflict resolution and playback of an extracted timeline.
pub fn perform<C: Clock>(
    mut timeline: Timeline,
    mut pipes: Vec<Pipe>,
    config: &PlayerConfig,
    clock: &C,
) -> RunSummary {
    if let Some(tempo) = timeline.detected_tempo {
        log::debug!("File tempo {:.1}/min", tempo);
    }
    let mut keys = KeyTable::from_notes(&timeline.notes);
    log::debug!("Total weight {:.0}", keys.total_weight());
    let assignment = assign::assign(&mut keys, &pipes);

    if config.dynamics {
        timeline.apply_dynamics();
    }
    let resolution = conflict::resolve(&mut timeline.notes, &keys);

    if config.dry_run {
        log::info!("Dry run: no pulse will be sent");
    }
    let playback = Scheduler::new(clock, PlaybackOptions::from(config)).play(&timeline, &keys, &mut pipes);

    RunSummary {
        notes: timeline.notes.len(),
        assignment,
        resolution,
        playback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::tests::{note_off, note_on, smf, tempo};
    use crate::relay::testing::{FakeHub, ManualClock};
    use std::rc::Rc;

    fn config() -> PlayerConfig {
        PlayerConfig::new("performance.mid".into())
    }

    #[test]
    fn two_spaced_notes_on_one_pipe() {
        // 120 bpm, 480 tpb: 384 ticks = 400 ms, 480 ticks = 500 ms
        let smf = smf(
            vec![vec![tempo(0, 500_000), note_on(0, 0, 60, 100), note_off(384, 0, 60), note_on(96, 0, 60, 100), note_off(384, 0, 60)]],
            480,
        );
        let stream = EventStream::from_smf(&smf).unwrap();
        let clock = Rc::new(ManualClock::default());
        let hub = FakeHub::new(&clock, &["tune00"]);

        let summary = play_stream(&stream, &config(), &hub, &*clock).unwrap();
        assert_eq!(summary.resolution, Resolution::default());
        assert_eq!(summary.playback.scheduled, 2);
        assert_eq!(summary.playback.busy_delay_ms, 0);
        assert_eq!(summary.playback.resyncs, 0);

        let pulses = hub.log.borrow();
        assert_eq!(pulses.len(), 2);
        assert_eq!((pulses[0].fire_at, pulses[0].duration), (100, 400));
        assert_eq!((pulses[1].fire_at, pulses[1].duration), (600, 400));
    }

    #[test]
    fn louder_overlapping_note_restrikes_the_pipe() {
        // second note starts 100 ms into the first, louder and shorter
        let smf = smf(
            vec![vec![note_on(0, 0, 60, 50), note_on(96, 0, 60, 120), note_off(96, 0, 60), note_off(96, 0, 60)]],
            480,
        );
        let stream = EventStream::from_smf(&smf).unwrap();
        let clock = Rc::new(ManualClock::default());
        let hub = FakeHub::new(&clock, &["tune00"]);

        let summary = play_stream(&stream, &config(), &hub, &*clock).unwrap();
        assert_eq!(summary.resolution.shortened, 1);

        let pulses = hub.log.borrow();
        assert_eq!(pulses.len(), 2);
        // first note cut to end 10 ms before the second starts
        assert_eq!(pulses[0].duration, 90);
        assert_eq!(pulses[1].fire_at - pulses[0].fire_at, 100);
        assert!(pulses[1].fire_at >= pulses[0].fire_at + pulses[0].duration as i64);
    }

    #[test]
    fn no_pipes_is_fatal_before_playback() {
        let smf = smf(vec![vec![note_on(0, 0, 60, 100), note_off(480, 0, 60)]], 480);
        let stream = EventStream::from_smf(&smf).unwrap();
        let clock = Rc::new(ManualClock::default());
        let hub = FakeHub::new(&clock, &[]);

        let err = play_stream(&stream, &config(), &hub, &*clock).unwrap_err();
        assert!(matches!(err, PipelineError::HardwareDiscovery(_)));
        assert!(hub.log.borrow().is_empty());
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn empty_performance_is_fatal() {
        let smf = smf(vec![vec![tempo(0, 500_000)]], 480);
        let stream = EventStream::from_smf(&smf).unwrap();
        let clock = Rc::new(ManualClock::default());
        let hub = FakeHub::new(&clock, &["tune00"]);
        let err = play_stream(&stream, &config(), &hub, &*clock).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
    }

    #[test]
    fn dynamics_run_once_and_dry_run_sends_nothing() {
        let smf = smf(
            vec![vec![note_on(0, 0, 60, 127), note_off(480, 0, 60), note_on(0, 0, 64, 64), note_off(480, 0, 64)]],
            480,
        );
        let stream = EventStream::from_smf(&smf).unwrap();
        let clock = Rc::new(ManualClock::default());
        let hub = FakeHub::new(&clock, &["tune00", "tune04"]);
        let mut config = config();
        config.dynamics = true;
        config.dry_run = true;

        let mut timeline = timeline::extract(&stream, &ExtractOptions::from(&config), &config.midi_file).unwrap();
        let pipes = organ::discover_pipes(&hub, config.max_offset).unwrap();
        assert!(timeline.apply_dynamics());
        let durations: Vec<i64> = timeline.notes.iter().map(|n| n.duration).collect();

        // perform must not scale a second time
        let summary = perform(timeline.clone(), pipes, &config, &*clock);
        assert_eq!(durations, vec![500, 251]);
        assert_eq!(summary.playback.scheduled, 2);
        assert!(hub.log.borrow().is_empty());
        // drained until the scaled second note ends
        assert_eq!(clock.now_ms(), 100 + 500 + 251);
    }
}
