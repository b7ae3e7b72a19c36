use crate::connection::{self, Session, SessionConfig, SessionEvent, SessionState};
use crate::registers::{
    convert_datapoint_value, convert_setpoint_value, to_raw_setpoint_value, Catalog,
    ControllerModel,
};
use crate::tunnel::{ModelInfo, SetpointWrite};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events buffered for the consumer; when it stops draining them, new
/// events are dropped rather than stalling the engine.
const EVENT_QUEUE: usize = 32;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no setpoint named `{name}` in the {model} catalog")]
    UnknownSetpoint { name: String, model: ControllerModel },
    #[error("value {value} for `{name}` encodes to raw {raw}, outside {min}..={max}")]
    OutOfRange {
        name: &'static str,
        value: f32,
        raw: i32,
        min: i32,
        max: i32,
    },
    #[error("session request failed")]
    Session(#[from] connection::Error),
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    Model(ModelInfo),
    Data(DataChange),
    Polled,
    Error(Arc<Error>),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DataChange {
    pub name: &'static str,
    pub value: f32,
    pub capability: &'static str,
    pub unit: &'static str,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub session: SessionConfig,
    pub model: ControllerModel,
    pub poll_interval: Duration,
    pub max_consecutive_errors: u32,
}

impl DeviceConfig {
    pub fn new(session: SessionConfig, model: ControllerModel) -> Self {
        DeviceConfig {
            session,
            model,
            poll_interval: Duration::from_secs(30),
            max_consecutive_errors: 3,
        }
    }
}

type ValueCache = Arc<Mutex<BTreeMap<&'static str, f32>>>;

/// One controller under periodic observation. Owns the session; polls the
/// catalog's registers, keeps the last converted value per register name,
/// and surfaces changes as events. The cache survives a disconnect so the
/// embedder can keep showing last-known values.
pub struct Device {
    session: Session,
    catalog: &'static Catalog,
    cache: ValueCache,
    events: mpsc::Sender<DeviceEvent>,
}

impl Device {
    pub async fn connect(
        config: DeviceConfig,
    ) -> Result<(Device, mpsc::Receiver<DeviceEvent>), Error> {
        let catalog = Catalog::for_model(config.model);
        let (session, session_events) = Session::connect(config.session).await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let cache: ValueCache = Arc::new(Mutex::new(BTreeMap::new()));
        emit(&events_tx, DeviceEvent::Connected);
        let engine = Engine {
            session: session.clone(),
            catalog,
            cache: Arc::clone(&cache),
            events: events_tx.clone(),
            poll_interval: config.poll_interval,
            max_consecutive_errors: config.max_consecutive_errors,
            consecutive_errors: 0,
        };
        tokio::spawn(engine.run(session_events));
        let device = Device {
            session,
            catalog,
            cache,
            events: events_tx,
        };
        Ok((device, events_rx))
    }

    pub fn catalog(&self) -> &'static Catalog {
        self.catalog
    }

    pub fn value(&self, name: &str) -> Option<f32> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    pub fn all_values(&self) -> BTreeMap<&'static str, f32> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Writes one setpoint by display name. The raw encoding is bounds
    /// checked before anything touches the wire; on success the cache is
    /// updated optimistically and a `Data` event fires.
    pub async fn set_value(&self, name: &str, value: f32) -> Result<(), Error> {
        let Some(setpoint) = self.catalog.setpoint_by_name(name) else {
            return Err(Error::UnknownSetpoint {
                name: name.to_owned(),
                model: self.catalog.model,
            });
        };
        let raw = to_raw_setpoint_value(value, setpoint);
        if raw < setpoint.min || raw > setpoint.max {
            return Err(Error::OutOfRange {
                name: setpoint.name,
                value,
                raw,
                min: setpoint.min,
                max: setpoint.max,
            });
        }
        self.session
            .write_setpoints(vec![SetpointWrite {
                id: 0,
                value: raw as u32,
                param: setpoint.write_address,
            }])
            .await?;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(setpoint.name, value);
        emit(
            &self.events,
            DeviceEvent::Data(DataChange {
                name: setpoint.name,
                value,
                capability: setpoint.capability,
                unit: setpoint.unit,
            }),
        );
        Ok(())
    }

    pub async fn set_fan_level(&self, level: u8) -> Result<(), Error> {
        self.set_value("fanLevel", f32::from(level)).await
    }

    pub async fn set_temperature_setpoint(&self, temperature: f32) -> Result<(), Error> {
        self.set_value("temperatureSetpoint", temperature).await
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }
}

fn emit(events: &mpsc::Sender<DeviceEvent>, event: DeviceEvent) {
    if let Err(error) = events.try_send(event) {
        warn!(message = "dropping device event, consumer is not draining", %error);
    }
}

struct Engine {
    session: Session,
    catalog: &'static Catalog,
    cache: ValueCache,
    events: mpsc::Sender<DeviceEvent>,
    poll_interval: Duration,
    max_consecutive_errors: u32,
    consecutive_errors: u32,
}

impl Engine {
    async fn run(mut self, mut session_events: mpsc::UnboundedReceiver<SessionEvent>) {
        // The first tick fires immediately: one poll right after connect,
        // then the periodic cadence.
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = session_events.recv() => match event {
                    None => {
                        emit(&self.events, DeviceEvent::Disconnected);
                        return;
                    }
                    Some(SessionEvent::Model(info)) => {
                        emit(&self.events, DeviceEvent::Model(info));
                    }
                    Some(SessionEvent::UnmatchedData { seq }) => {
                        debug!(message = "discarding uncorrelated reply", seq);
                    }
                    Some(SessionEvent::Closed { reason }) => {
                        if let Some(reason) = reason {
                            emit(&self.events, DeviceEvent::Error(Arc::new(reason.into())));
                        }
                        emit(&self.events, DeviceEvent::Disconnected);
                        return;
                    }
                },
                _ = ticker.tick() => self.poll().await,
            }
        }
    }

    async fn poll(&mut self) {
        if self.session.state() != SessionState::Connected {
            return;
        }
        match self.poll_round().await {
            Ok(()) => {
                self.consecutive_errors = 0;
                emit(&self.events, DeviceEvent::Polled);
            }
            Err(error) => {
                self.consecutive_errors += 1;
                warn!(
                    message = "poll failed",
                    consecutive = self.consecutive_errors,
                    %error,
                );
                emit(&self.events, DeviceEvent::Error(Arc::new(error)));
                if self.consecutive_errors >= self.max_consecutive_errors {
                    self.consecutive_errors = 0;
                    self.session.disconnect().await;
                }
            }
        }
    }

    /// One round: every datapoint, then every readable setpoint. Replies
    /// are positional, so values re-associate with registers by index; a
    /// short reply leaves the tail registers untouched for this round.
    async fn poll_round(&mut self) -> Result<(), Error> {
        let values = self
            .session
            .read_datapoints(self.catalog.datapoint_request_list())
            .await?;
        for (reg, raw) in self.catalog.datapoints.iter().zip(values) {
            self.store(
                reg.name,
                convert_datapoint_value(raw, reg),
                reg.capability,
                reg.unit,
            );
        }
        let values = self
            .session
            .read_setpoints(self.catalog.setpoint_request_list())
            .await?;
        for (reg, raw) in self.catalog.readable_setpoints().zip(values) {
            self.store(
                reg.name,
                convert_setpoint_value(raw, reg),
                reg.capability,
                reg.unit,
            );
        }
        Ok(())
    }

    fn store(&self, name: &'static str, value: f32, capability: &'static str, unit: &'static str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.get(name) == Some(&value) {
            return;
        }
        cache.insert(name, value);
        drop(cache);
        emit(
            &self.events,
            DeviceEvent::Data(DataChange {
                name,
                value,
                capability,
                unit,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeController;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config(fake: &FakeController, model: ControllerModel) -> DeviceConfig {
        let mut session = SessionConfig::new("GEN123", IpAddr::V4(Ipv4Addr::LOCALHOST), "a@b");
        session.port = fake.addr.port();
        session.connect_retries = 2;
        session.connect_retry_interval = Duration::from_millis(50);
        session.request_timeout = Duration::from_millis(100);
        session.keepalive_interval = Duration::from_secs(60);
        let mut config = DeviceConfig::new(session, model);
        config.poll_interval = Duration::from_millis(50);
        config
    }

    fn optima270_fake_values() -> Vec<i16> {
        vec![210, 200, 214, 224, 45, 50, 40, 160, 100, 0, 120, 50]
    }

    async fn next_event(events: &mut mpsc::Receiver<DeviceEvent>) -> DeviceEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a device event")
            .expect("event channel closed")
    }

    /// Drains events until the first `Polled`, returning the data changes
    /// seen on the way.
    async fn changes_until_polled(events: &mut mpsc::Receiver<DeviceEvent>) -> Vec<DataChange> {
        let mut changes = Vec::new();
        loop {
            match next_event(events).await {
                DeviceEvent::Data(change) => changes.push(change),
                DeviceEvent::Polled => return changes,
                DeviceEvent::Error(error) => panic!("unexpected poll error: {error}"),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn first_poll_fills_the_cache_with_converted_values() {
        let fake = FakeController::spawn("GEN123", 1).await;
        fake.set_datapoint_values(optima270_fake_values());
        fake.set_setpoint_values(vec![3, 120, 1, 6]);
        let (device, mut events) =
            Device::connect(test_config(&fake, ControllerModel::Optima270))
                .await
                .unwrap();
        assert!(matches!(next_event(&mut events).await, DeviceEvent::Connected));
        let changes = changes_until_polled(&mut events).await;
        let supply = changes
            .iter()
            .find(|change| change.name == "supplyTemperature")
            .unwrap();
        assert_eq!(supply.value, -9.0);
        assert_eq!(supply.unit, "°C");
        assert_eq!(device.value("supplyTemperature"), Some(-9.0));
        assert_eq!(device.value("outsideTemperature"), Some(-10.0));
        assert_eq!(device.value("humidity"), Some(45.0));
        // Setpoints read back converted too: raw 120 is 22.0 degrees.
        assert_eq!(device.value("temperatureSetpoint"), Some(22.0));
        assert_eq!(device.value("fanLevel"), Some(3.0));
        device.disconnect().await;
    }

    #[tokio::test]
    async fn unchanged_values_emit_no_data_events() {
        let fake = FakeController::spawn("GEN123", 1).await;
        fake.set_datapoint_values(optima270_fake_values());
        fake.set_setpoint_values(vec![3, 120, 1, 6]);
        let (_device, mut events) =
            Device::connect(test_config(&fake, ControllerModel::Optima270))
                .await
                .unwrap();
        let first = changes_until_polled(&mut events).await;
        assert!(!first.is_empty());
        let second = changes_until_polled(&mut events).await;
        assert_eq!(second, Vec::new());
    }

    #[tokio::test]
    async fn short_replies_leave_tail_registers_unset() {
        let fake = FakeController::spawn("GEN123", 1).await;
        // 11 of the 12 requested datapoints answered; the last catalog
        // entry gets no value this round.
        fake.set_datapoint_values(vec![210, 200, 214, 224, 45, 50, 40, 160, 100, 0, 120]);
        fake.set_setpoint_values(vec![3, 120, 1, 6]);
        let (device, mut events) =
            Device::connect(test_config(&fake, ControllerModel::Optima270))
                .await
                .unwrap();
        changes_until_polled(&mut events).await;
        assert_eq!(device.value("supplyTemperature"), Some(-9.0));
        assert_eq!(device.value("sacrificialAnode"), None);
        device.disconnect().await;
    }

    #[tokio::test]
    async fn three_failed_polls_tear_the_session_down_but_keep_the_cache() {
        let fake = FakeController::spawn("GEN123", 1).await;
        fake.set_datapoint_values(optima270_fake_values());
        fake.set_setpoint_values(vec![3, 120, 1, 6]);
        let (device, mut events) =
            Device::connect(test_config(&fake, ControllerModel::Optima270))
                .await
                .unwrap();
        changes_until_polled(&mut events).await;
        fake.set_silent_data(true);
        let mut errors = 0;
        loop {
            match next_event(&mut events).await {
                DeviceEvent::Error(_) => errors += 1,
                DeviceEvent::Disconnected => break,
                DeviceEvent::Polled => panic!("poll succeeded against a silent device"),
                _ => continue,
            }
        }
        assert_eq!(errors, 3);
        assert_eq!(device.value("supplyTemperature"), Some(-9.0));
        assert!(!device.all_values().is_empty());
    }

    #[tokio::test]
    async fn set_value_converts_validates_and_writes() {
        let fake = FakeController::spawn("GEN123", 1).await;
        fake.set_datapoint_values(optima270_fake_values());
        fake.set_setpoint_values(vec![3, 120, 1, 6]);
        let (device, mut events) =
            Device::connect(test_config(&fake, ControllerModel::Optima270))
                .await
                .unwrap();
        changes_until_polled(&mut events).await;
        device.set_value("temperatureSetpoint", 22.0).await.unwrap();
        assert_eq!(
            fake.writes(),
            vec![SetpointWrite {
                id: 0,
                value: 120,
                param: 12,
            }]
        );
        assert_eq!(device.value("temperatureSetpoint"), Some(22.0));
        device.disconnect().await;
    }

    #[tokio::test]
    async fn out_of_range_writes_never_touch_the_wire() {
        let fake = FakeController::spawn("GEN123", 1).await;
        let (device, _events) =
            Device::connect(test_config(&fake, ControllerModel::Optima270))
                .await
                .unwrap();
        match device.set_value("temperatureSetpoint", 35.0).await {
            Err(Error::OutOfRange { raw, min, max, .. }) => {
                assert_eq!((raw, min, max), (250, 0, 200));
            }
            other => panic!("expected an out-of-range error, got {other:?}"),
        }
        assert_eq!(fake.writes(), Vec::new());
        device.disconnect().await;
    }

    #[tokio::test]
    async fn unknown_setpoints_are_rejected() {
        let fake = FakeController::spawn("GEN123", 1).await;
        let (device, _events) =
            Device::connect(test_config(&fake, ControllerModel::Optima270))
                .await
                .unwrap();
        let result = device.set_value("frobnicator", 1.0).await;
        assert!(matches!(result, Err(Error::UnknownSetpoint { .. })));
        device.disconnect().await;
    }

    #[tokio::test]
    async fn fan_level_helper_uses_the_write_address() {
        let fake = FakeController::spawn("GEN123", 1).await;
        let (device, _events) =
            Device::connect(test_config(&fake, ControllerModel::Optima270))
                .await
                .unwrap();
        device.set_fan_level(2).await.unwrap();
        assert_eq!(
            fake.writes(),
            vec![SetpointWrite {
                id: 0,
                value: 2,
                param: 24,
            }]
        );
        device.disconnect().await;
    }
}
