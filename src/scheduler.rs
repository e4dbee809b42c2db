use std::thread;
use std::time::{Duration, Instant};

use crate::midi::midi_note_to_name;
use crate::organ::{KeyTable, Pipe};
use crate::timeline::{Note, Timeline};

/// Delay between starting playback and the first note.
const LEAD_IN_MS: i64 = 100;
/// Upper bound of the pause given to the hub between two commands.
const MAX_FLUSH_MS: i64 = 25;
/// The flush pause stops this long before a note is due.
const FLUSH_MARGIN_MS: i64 = 4;

/// Time source for the scheduler, in milliseconds.
pub trait Clock {
    fn now_ms(&self) -> i64;
    fn sleep_ms(&self, ms: i64);
}

/// Wall clock, counting from its creation.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    fn sleep_ms(&self, ms: i64) {
        if ms > 0 {
            thread::sleep(Duration::from_millis(ms as u64));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scheduling,
    /// All pulses issued, waiting for the last pipe to fall silent.
    Draining,
    Done,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackOptions {
    /// Do all the bookkeeping but send nothing to the relays.
    pub dry_run: bool,
    /// Log every note and every channel change.
    pub verbose: bool,
}

/// Counters collected during playback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackReport {
    pub scheduled: usize,
    pub cancelled: usize,
    /// Notes whose key has no pipe.
    pub missing: usize,
    /// Total time notes were pushed back because their pipe was still sounding.
    pub busy_delay_ms: i64,
    pub resyncs: usize,
    /// Worst lateness seen before a resync.
    pub max_lag_ms: i64,
    pub failed_pulses: usize,
}

/// Issues the relay pulses for a resolved timeline, one note at a time.
pub struct Scheduler<'a, C: Clock> {
    clock: &'a C,
    options: PlaybackOptions,
    state: SchedulerState,
    /// Clock time of performance time zero.
    start_time: i64,
    last_channel: Option<u8>,
    report: PlaybackReport,
}

impl<'a, C: Clock> Scheduler<'a, C> {
    pub fn new(clock: &'a C, options: PlaybackOptions) -> Self {
        Self {
            clock,
            options,
            state: SchedulerState::Idle,
            start_time: 0,
            last_channel: None,
            report: PlaybackReport::default(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Plays `timeline` on `pipes`. Blocks until the last pipe is silent.
    pub fn play(&mut self, timeline: &Timeline, keys: &KeyTable, pipes: &mut [Pipe]) -> PlaybackReport {
        let Some(first) = timeline.notes.first() else {
            self.state = SchedulerState::Done;
            return self.report;
        };

        self.state = SchedulerState::Scheduling;
        self.start_time = self.clock.now_ms() + LEAD_IN_MS - first.start;
        for note in &timeline.notes {
            self.schedule(note, timeline, keys, pipes);
        }

        self.state = SchedulerState::Draining;
        let now = self.clock.now_ms();
        if let Some(last) = pipes.iter().map(|p| p.busy_until).max() {
            self.clock.sleep_ms(last - now);
        }
        self.state = SchedulerState::Done;

        log::info!(
            "Playback finished: {} notes played, {} cancelled, {} missing, {} resyncs",
            self.report.scheduled,
            self.report.cancelled,
            self.report.missing,
            self.report.resyncs
        );
        self.report
    }

    fn schedule(&mut self, note: &Note, timeline: &Timeline, keys: &KeyTable, pipes: &mut [Pipe]) {
        if note.is_cancelled() {
            self.report.cancelled += 1;
            return;
        }
        let Some(pipe) = keys.pipe_for(note.key).and_then(|id| pipes.get_mut(id.0)) else {
            log::info!("Missing note {} ({})", note.key, midi_note_to_name(note.key));
            self.report.missing += 1;
            return;
        };

        let now = self.clock.now_ms();
        if pipe.busy_until > now {
            // The pipe is still sounding: a new pulse would cut it off
            let due = self.start_time + note.start;
            self.report.busy_delay_ms += (pipe.busy_until - due).max(0);
            log::debug!("Pipe {:02} busy, waiting {}ms", pipe.offset, pipe.busy_until - now);
            self.clock.sleep_ms(pipe.busy_until - now);
        } else {
            let flush = (self.start_time + note.start - now - FLUSH_MARGIN_MS).min(MAX_FLUSH_MS);
            self.clock.sleep_ms(flush);
        }

        let now = self.clock.now_ms();
        let mut wait = self.start_time + note.start - now;
        if wait < 0 {
            log::warn!("Running {}ms late, resynchronizing", -wait);
            self.report.resyncs += 1;
            self.report.max_lag_ms = self.report.max_lag_ms.max(-wait);
            self.start_time = now - note.start;
            wait = 0;
        }

        if !self.options.dry_run {
            let delay = u32::try_from(wait).unwrap_or(u32::MAX);
            let duration = u32::try_from(note.duration).unwrap_or(u32::MAX);
            if let Err(e) = pipe.relay.delayed_pulse(delay, duration) {
                log::warn!("{:#}", e);
                self.report.failed_pulses += 1;
            }
        }
        pipe.busy_until = self.start_time + note.start + note.duration;
        self.report.scheduled += 1;

        if self.options.verbose {
            if self.last_channel != Some(note.channel) {
                let name = timeline.channel_names.get(&note.channel).map_or("", String::as_str);
                log::info!("#{}: {}", note.channel, name);
            }
            log::info!(
                "[{} -> pipe {:02}: {}ms in {}ms @{:.0}%]",
                midi_note_to_name(note.key),
                pipe.offset,
                note.duration,
                wait,
                100.0 * note.velocity
            );
        }
        self.last_channel = Some(note.channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::*;
    use crate::organ::PipeId;
    use std::rc::Rc;

    fn note(start: i64, key: u8, duration: i64) -> Note {
        Note { channel: 1, start, key, duration, velocity: 0.8 }
    }

    fn timeline(notes: Vec<Note>) -> Timeline {
        Timeline { notes, ..Default::default() }
    }

    /// Key 60 + n plays on pipe n.
    fn keys_for(notes: &[Note], pipe_count: usize) -> KeyTable {
        let mut keys = KeyTable::from_notes(notes);
        for pipe in 0..pipe_count {
            keys.assign_if_free(60 + pipe, PipeId(pipe));
        }
        keys
    }

    #[test]
    fn notes_fire_at_their_scheduled_time() {
        let clock = Rc::new(ManualClock::default());
        let (mut pipes, log) = pipes_with_offsets(&clock, &[0, 1]);
        let timeline = timeline(vec![note(0, 60, 200), note(300, 61, 100), note(600, 60, 50)]);
        let keys = keys_for(&timeline.notes, 2);

        let mut scheduler = Scheduler::new(&*clock, PlaybackOptions::default());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        let report = scheduler.play(&timeline, &keys, &mut pipes);
        assert_eq!(scheduler.state(), SchedulerState::Done);

        let fire: Vec<(String, i64, u32)> =
            log.borrow().iter().map(|p| (p.relay.clone(), p.fire_at, p.duration)).collect();
        assert_eq!(
            fire,
            vec![("tune00".into(), 100, 200), ("tune01".into(), 400, 100), ("tune00".into(), 700, 50)]
        );
        assert_eq!(report.scheduled, 3);
        assert_eq!(report.resyncs, 0);
        assert_eq!(report.busy_delay_ms, 0);
        // drained until the last pipe went quiet
        assert_eq!(clock.now_ms(), 750);
    }

    #[test]
    fn first_note_offset_is_removed_by_the_lead_in() {
        let clock = Rc::new(ManualClock::default());
        clock.advance(1_000);
        let (mut pipes, log) = pipes_with_offsets(&clock, &[0]);
        let timeline = timeline(vec![note(5_000, 60, 100)]);
        let keys = keys_for(&timeline.notes, 1);
        Scheduler::new(&*clock, PlaybackOptions::default()).play(&timeline, &keys, &mut pipes);
        assert_eq!(log.borrow()[0].fire_at, 1_100);
    }

    #[test]
    fn busy_pipe_blocks_until_free_and_resyncs_when_late() {
        let clock = Rc::new(ManualClock::default());
        let (mut pipes, log) = pipes_with_offsets(&clock, &[0, 1]);
        let timeline = timeline(vec![note(0, 60, 400), note(100, 60, 100), note(300, 61, 100)]);
        let keys = keys_for(&timeline.notes, 2);

        let report = Scheduler::new(&*clock, PlaybackOptions::default()).play(&timeline, &keys, &mut pipes);
        let fire: Vec<i64> = log.borrow().iter().map(|p| p.fire_at).collect();
        // second note waits for pipe 0, then the whole schedule shifts by 300ms
        assert_eq!(fire, vec![100, 500, 700]);
        assert_eq!(report.resyncs, 1);
        assert_eq!(report.max_lag_ms, 300);
        assert_eq!(report.busy_delay_ms, 300);
    }

    #[test]
    fn pulses_on_one_pipe_never_overlap() {
        let clock = Rc::new(ManualClock::default());
        let (mut pipes, log) = pipes_with_offsets(&clock, &[0, 1, 2]);
        let notes: Vec<Note> = (0..30).map(|i| note(i * 70, 60 + (i % 3) as u8, 90 + (i % 4) * 80)).collect();
        let timeline = timeline(notes);
        let keys = keys_for(&timeline.notes, 3);

        Scheduler::new(&*clock, PlaybackOptions::default()).play(&timeline, &keys, &mut pipes);
        let pulses = log.borrow();
        assert_eq!(pulses.len(), 30);
        for (i, a) in pulses.iter().enumerate() {
            if let Some(b) = pulses[i + 1..].iter().find(|b| b.relay == a.relay) {
                assert!(b.fire_at >= a.fire_at + a.duration as i64, "{:?} then {:?}", a, b);
            }
        }
    }

    #[test]
    fn cancelled_and_missing_notes_are_skipped() {
        let clock = Rc::new(ManualClock::default());
        let (mut pipes, log) = pipes_with_offsets(&clock, &[0]);
        let timeline = timeline(vec![note(0, 60, 100), note(50, 60, 0), note(80, 99, 100)]);
        let keys = keys_for(&timeline.notes, 1);

        let report = Scheduler::new(&*clock, PlaybackOptions::default()).play(&timeline, &keys, &mut pipes);
        assert_eq!(log.borrow().len(), 1);
        assert_eq!((report.scheduled, report.cancelled, report.missing), (1, 1, 1));
    }

    #[test]
    fn dry_run_keeps_bookkeeping_without_pulses() {
        let clock = Rc::new(ManualClock::default());
        let (mut pipes, log) = pipes_with_offsets(&clock, &[0]);
        let timeline = timeline(vec![note(0, 60, 300), note(500, 60, 200)]);
        let keys = keys_for(&timeline.notes, 1);

        let options = PlaybackOptions { dry_run: true, verbose: true };
        let report = Scheduler::new(&*clock, options).play(&timeline, &keys, &mut pipes);
        assert!(log.borrow().is_empty());
        assert_eq!(report.scheduled, 2);
        assert_eq!(pipes[0].busy_until, 800);
    }

    #[test]
    fn relay_failures_do_not_stop_playback() {
        let clock = Rc::new(ManualClock::default());
        let mut pipes = vec![Pipe::new(failing_relay(&clock, "tune00"), 0)];
        let timeline = timeline(vec![note(0, 60, 100), note(200, 60, 100)]);
        let keys = keys_for(&timeline.notes, 1);

        let report = Scheduler::new(&*clock, PlaybackOptions::default()).play(&timeline, &keys, &mut pipes);
        assert_eq!(report.failed_pulses, 2);
        assert_eq!(report.scheduled, 2);
    }

    #[test]
    fn empty_timeline_finishes_immediately() {
        let clock = ManualClock::default();
        let mut scheduler = Scheduler::new(&clock, PlaybackOptions::default());
        let report = scheduler.play(&Timeline::default(), &KeyTable::from_notes(&[]), &mut []);
        assert_eq!(scheduler.state(), SchedulerState::Done);
        assert_eq!(report, PlaybackReport::default());
    }
}
