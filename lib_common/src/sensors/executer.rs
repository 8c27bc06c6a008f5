//! # Sensor Executer
//!
//! The poll loop of a sensor node. Every cycle updates each sensor, turns
//! each detected transition into exactly one outbound event, adds the
//! sensors' own periodic reports and, when due, a full-state snapshot. Events
//! go to an [`EventSink`] and are delivered off the loop.
//!
//! ## Transition rules
//! | forced alert | state changed | self-reporting | into      | event                                          |
//! |--------------|---------------|----------------|-----------|------------------------------------------------|
//! | yes          | any           | any            | any       | the forced alert                               |
//! | no           | no            | any            | -         | none                                           |
//! | no           | yes           | yes            | -         | none                                           |
//! | no           | yes           | no             | triggered | alert(1) if `trigger_alert`, else change(1)    |
//! | no           | yes           | no             | normal    | alert(0) if `trigger_alert_normal`, else change(0) |

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::device::SensorDevice;
use super::error::SensorError;
use crate::connection::{EventSink, OutboundEvent, RegistrationProvider, ServerCommunication};
use crate::protocol::{NodeManifest, SensorManifest, SensorsState, StateChange};

/// # Sensor Board
///
/// The latest published view of every sensor, shared with the connection
/// engine for registration manifests and full-state snapshots. The poll loop
/// is the only writer.
#[derive(Debug, Default)]
pub struct SensorBoard {
    view: RwLock<BoardView>,
}

#[derive(Debug, Default, Clone)]
struct BoardView {
    manifests: Vec<SensorManifest>,
    statuses: Vec<StateChange>,
}

impl SensorBoard {
    pub fn publish(&self, sensors: &[Box<dyn SensorDevice>]) {
        let view = BoardView {
            manifests: sensors.iter().map(|s| s.core().manifest()).collect(),
            statuses: sensors.iter().map(|s| s.core().status()).collect(),
        };
        *self.view.write().unwrap_or_else(|p| p.into_inner()) = view;
    }

    pub fn snapshot(&self) -> Vec<StateChange> {
        self.view.read().unwrap_or_else(|p| p.into_inner()).statuses.clone()
    }
}

impl RegistrationProvider for SensorBoard {
    fn manifest(&self) -> NodeManifest {
        NodeManifest::Sensors(self.view.read().unwrap_or_else(|p| p.into_inner()).manifests.clone())
    }

    fn sensors_state(&self) -> Option<SensorsState> {
        Some(SensorsState { sensors: self.snapshot() })
    }
}

/// # Sensor Poller
///
/// One poll cycle, separated from the loop so it can be driven directly.
pub struct SensorPoller {
    sensors: Vec<Box<dyn SensorDevice>>,
    board: Arc<SensorBoard>,
    full_state_interval: Duration,
    last_full_state: Option<Instant>,
    seen_epoch: Option<u64>,
}

impl SensorPoller {
    /// Takes initialized sensors and publishes their initial state.
    pub fn new(sensors: Vec<Box<dyn SensorDevice>>, full_state_interval: Duration) -> Self {
        let board = Arc::new(SensorBoard::default());
        board.publish(&sensors);
        Self { sensors, board, full_state_interval, last_full_state: None, seen_epoch: None }
    }

    pub fn board(&self) -> Arc<SensorBoard> {
        Arc::clone(&self.board)
    }

    pub fn sensors(&self) -> &[Box<dyn SensorDevice>] {
        &self.sensors
    }

    /// # Poll Cycle
    ///
    /// `epoch` is the connection epoch the events are meant for; a new epoch
    /// makes the full-state snapshot due immediately.
    pub fn poll_cycle(&mut self, now: Instant, epoch: u64) -> Vec<OutboundEvent> {
        let mut events = Vec::new();

        // --- Phase 1: Transitions ---
        for sensor in self.sensors.iter_mut() {
            if let Err(e) = evaluate(sensor.as_mut(), &mut events) {
                let core = sensor.core();
                error!(sensor_id = core.id, description = %core.description, "Sensor evaluation failed: {}", e);
            }
        }

        // --- Phase 2: Periodic reports ---
        for sensor in self.sensors.iter_mut() {
            match sensor.force_send_state() {
                Ok(Some(change)) => events.push(OutboundEvent::StateChange(change)),
                Ok(None) => {}
                Err(e) => error!(sensor_id = sensor.core().id, "Forced state report failed: {}", e),
            }
        }

        self.board.publish(&self.sensors);

        // --- Phase 3: Full state ---
        if self.seen_epoch != Some(epoch) {
            self.seen_epoch = Some(epoch);
            self.last_full_state = None;
        }
        let due = self
            .last_full_state
            .map_or(true, |last| now.saturating_duration_since(last) > self.full_state_interval);
        if due {
            debug!(epoch, "Full state due");
            events.push(OutboundEvent::SensorsState);
            self.last_full_state = Some(now);
        }

        events
    }
}

/// Updates one sensor and records at most one event for it.
fn evaluate(sensor: &mut dyn SensorDevice, events: &mut Vec<OutboundEvent>) -> Result<(), SensorError> {
    let old_state = sensor.state();
    sensor.update_state()?;
    let current_state = sensor.state();

    if let Some(alert) = sensor.force_send_alert()? {
        info!(sensor_id = alert.sensor_id, state = alert.state, "Sensor forced an alert");
        events.push(OutboundEvent::SensorAlert(alert));
        return Ok(());
    }

    let core = sensor.core();
    if old_state == current_state || core.handles_state_msgs {
        return Ok(());
    }

    let event = if current_state == core.trigger_state {
        if core.trigger_alert {
            info!(sensor_id = core.id, description = %core.description, "Sensor triggered");
            OutboundEvent::SensorAlert(core.alert(1))
        } else {
            debug!(sensor_id = core.id, "Sensor triggered, reporting state only");
            OutboundEvent::StateChange(core.state_change(1))
        }
    } else if core.trigger_alert_normal {
        info!(sensor_id = core.id, description = %core.description, "Sensor back to normal");
        OutboundEvent::SensorAlert(core.alert(0))
    } else {
        debug!(sensor_id = core.id, "Sensor back to normal, reporting state only");
        OutboundEvent::StateChange(core.state_change(0))
    };
    events.push(event);
    Ok(())
}

/// # Sensor Executer
///
/// Runs poll cycles at a fixed cadence while the engine is connected and
/// hands every event to the sink.
pub struct SensorExecuter {
    poller: SensorPoller,
    comm: Arc<ServerCommunication>,
    sink: Arc<dyn EventSink>,
    poll_interval: Duration,
}

impl SensorExecuter {
    pub fn new(poller: SensorPoller, comm: Arc<ServerCommunication>, sink: Arc<dyn EventSink>) -> Self {
        let poll_interval = comm.timings().poll_interval();
        Self { poller, comm, sink, poll_interval }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut waiting = false;
        loop {
            ticker.tick().await;
            // Sensors are not advanced while there is nobody to report to.
            if !self.comm.is_connected() {
                if !waiting {
                    debug!("Waiting for the server connection before polling");
                    waiting = true;
                }
                continue;
            }
            waiting = false;

            for event in self.poller.poll_cycle(Instant::now(), self.comm.epoch()) {
                self.sink.dispatch(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::connection::testing::{test_settings, Harness};
    use crate::protocol::SensorAlert;
    use crate::sensors::device::SensorCore;

    /// Follows a scripted sequence of raw states.
    struct ScriptedSensor {
        core: SensorCore,
        states: VecDeque<u8>,
        forced_alert: Option<SensorAlert>,
        forced_state: bool,
        failing: bool,
        updates: Arc<Mutex<u32>>,
    }

    impl ScriptedSensor {
        fn new(id: u32, states: &[u8]) -> Self {
            Self {
                core: SensorCore::new(id, format!("sensor {id}"), 1).unwrap(),
                states: states.iter().copied().collect(),
                forced_alert: None,
                forced_state: false,
                failing: false,
                updates: Arc::default(),
            }
        }

        fn boxed(self) -> Box<dyn SensorDevice> {
            Box::new(self)
        }
    }

    impl SensorDevice for ScriptedSensor {
        fn core(&self) -> &SensorCore {
            &self.core
        }

        fn initialize(&mut self) -> Result<(), SensorError> {
            Ok(())
        }

        fn update_state(&mut self) -> Result<(), SensorError> {
            *self.updates.lock().unwrap() += 1;
            if self.failing {
                return Err(SensorError::Parse("sensor unplugged".into()));
            }
            if let Some(state) = self.states.pop_front() {
                self.core.state = state;
            }
            Ok(())
        }

        fn force_send_alert(&mut self) -> Result<Option<SensorAlert>, SensorError> {
            Ok(self.forced_alert.take())
        }

        fn force_send_state(&mut self) -> Result<Option<StateChange>, SensorError> {
            Ok(self.forced_state.then(|| self.core.status()))
        }
    }

    fn poller(sensors: Vec<Box<dyn SensorDevice>>) -> SensorPoller {
        SensorPoller::new(sensors, Duration::from_secs(60))
    }

    /// Drops the full-state snapshot the first cycle always carries.
    fn transitions(events: Vec<OutboundEvent>) -> Vec<OutboundEvent> {
        events.into_iter().filter(|e| *e != OutboundEvent::SensorsState).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_truth_table() {
        for (trigger_alert, trigger_alert_normal) in [(true, true), (true, false), (false, true), (false, false)] {
            let mut sensor = ScriptedSensor::new(1, &[1, 0]);
            sensor.core.trigger_alert = trigger_alert;
            sensor.core.trigger_alert_normal = trigger_alert_normal;
            let mut poller = poller(vec![sensor.boxed()]);

            let into_triggered = transitions(poller.poll_cycle(Instant::now(), 1));
            let into_normal = transitions(poller.poll_cycle(Instant::now(), 1));
            assert_eq!(into_triggered.len(), 1);
            assert_eq!(into_normal.len(), 1);

            match &into_triggered[0] {
                OutboundEvent::SensorAlert(alert) => assert!(trigger_alert && alert.state == 1),
                OutboundEvent::StateChange(change) => assert!(!trigger_alert && change.state == 1),
                other => panic!("unexpected {other:?}"),
            }
            match &into_normal[0] {
                OutboundEvent::SensorAlert(alert) => assert!(trigger_alert_normal && alert.state == 0),
                OutboundEvent::StateChange(change) => assert!(!trigger_alert_normal && change.state == 0),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_event_per_transition() {
        let mut poller = poller(vec![ScriptedSensor::new(1, &[1, 1, 1, 0, 0]).boxed()]);
        let counts: Vec<usize> = (0..5).map(|_| transitions(poller.poll_cycle(Instant::now(), 1)).len()).collect();
        assert_eq!(counts, vec![1, 0, 0, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_reporting_sensor_is_not_diffed() {
        let mut sensor = ScriptedSensor::new(1, &[1, 0]);
        sensor.core.handles_state_msgs = true;
        let mut poller = poller(vec![sensor.boxed()]);
        assert!(transitions(poller.poll_cycle(Instant::now(), 1)).is_empty());
        assert!(transitions(poller.poll_cycle(Instant::now(), 1)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_alert_takes_priority() {
        let mut sensor = ScriptedSensor::new(1, &[1]);
        sensor.core.trigger_alert = false;
        let mut forced = sensor.core.alert(1);
        forced.optional_data = Some(serde_json::Map::from_iter([("reason".to_string(), "tamper".into())]));
        sensor.forced_alert = Some(forced.clone());
        let mut poller = poller(vec![sensor.boxed()]);

        let events = transitions(poller.poll_cycle(Instant::now(), 1));
        assert_eq!(events, vec![OutboundEvent::SensorAlert(forced)]);
        // The forced cycle adopted the new state as baseline.
        assert!(transitions(poller.poll_cycle(Instant::now(), 1)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_state_reports_are_added() {
        let mut sensor = ScriptedSensor::new(1, &[1]);
        sensor.forced_state = true;
        let mut poller = poller(vec![sensor.boxed()]);
        let events = transitions(poller.poll_cycle(Instant::now(), 1));
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], OutboundEvent::SensorAlert(_)));
        assert!(matches!(&events[1], OutboundEvent::StateChange(c) if c.state == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_sensor_does_not_stop_the_cycle() {
        let mut broken = ScriptedSensor::new(1, &[]);
        broken.failing = true;
        let broken_updates = Arc::clone(&broken.updates);
        let mut poller = poller(vec![broken.boxed(), ScriptedSensor::new(2, &[1]).boxed()]);

        let events = transitions(poller.poll_cycle(Instant::now(), 1));
        assert_eq!(*broken_updates.lock().unwrap(), 1);
        assert!(matches!(&events[..], [OutboundEvent::SensorAlert(a)] if a.sensor_id == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_state_timer_and_reconnects() {
        let mut poller = poller(vec![ScriptedSensor::new(1, &[]).boxed()]);
        let full = |events: &[OutboundEvent]| events.iter().filter(|e| **e == OutboundEvent::SensorsState).count();
        let start = Instant::now();

        assert_eq!(full(&poller.poll_cycle(start, 1)), 1);
        assert_eq!(full(&poller.poll_cycle(start + Duration::from_secs(30), 1)), 0);
        assert_eq!(full(&poller.poll_cycle(start + Duration::from_secs(60), 1)), 0);
        assert_eq!(full(&poller.poll_cycle(start + Duration::from_secs(61), 1)), 1);
        // A new connection epoch resyncs immediately.
        assert_eq!(full(&poller.poll_cycle(start + Duration::from_secs(62), 2)), 1);
        assert_eq!(full(&poller.poll_cycle(start + Duration::from_secs(63), 2)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_board_tracks_published_state() {
        let mut poller = poller(vec![ScriptedSensor::new(4, &[1]).boxed()]);
        let board = poller.board();
        assert_eq!(board.snapshot()[0].state, 0);

        poller.poll_cycle(Instant::now(), 1);
        assert_eq!(board.snapshot()[0].state, 1);
        let NodeManifest::Sensors(manifests) = board.manifest() else { panic!("sensor manifest expected") };
        assert_eq!(manifests[0].sensor_id, 4);
        assert_eq!(manifests[0].state, 1);
        assert_eq!(poller.sensors().len(), 1);
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<OutboundEvent>>,
    }

    impl EventSink for RecordingSink {
        fn dispatch(&self, event: OutboundEvent) -> bool {
            self.events.lock().unwrap().push(event);
            true
        }
    }

    #[tokio::test]
    async fn test_executer_waits_for_the_connection() {
        let sensor = ScriptedSensor::new(1, &[1]);
        let updates = Arc::clone(&sensor.updates);
        let poller = poller(vec![sensor.boxed()]);

        let mut settings = test_settings();
        settings.timings.poll_interval_ms = 5;
        let harness = Harness::with_provider(poller.board(), settings);
        let sink = Arc::new(RecordingSink::default());
        let executer = SensorExecuter::new(poller, harness.comm.clone(), sink.clone());
        let running = tokio::spawn(executer.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*updates.lock().unwrap(), 0);
        assert!(sink.events.lock().unwrap().is_empty());

        let _server = harness.connect().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        running.abort();

        assert!(*updates.lock().unwrap() > 0);
        let events = sink.events.lock().unwrap().clone();
        assert!(events.contains(&OutboundEvent::SensorsState));
        assert_eq!(events.iter().filter(|e| matches!(e, OutboundEvent::SensorAlert(_))).count(), 1);
    }
}
