use std::{sync::Arc, time::Duration};

use anyhow::Result;
use serde_json::{json, Value};
use shared_logging::LogLevel;
use shared_message_bus::{BusConnector, BusMessage, BusPublisher};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    archive::ArchiveRecorder,
    ingest::{parse_payload, IngestArbitrator, IngestError, SubmitOutcome},
    state::SourceMode,
    telemetry::EngineTelemetry,
};

/// Consumer of messages delivered by a supervised subscription.
pub trait BusHandler: Send + Sync {
    /// Handles one message. Failures are reported by the handler itself.
    fn handle(&self, message: &BusMessage);
}

/// Where a push-transport message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Telemetry payload submitted on behalf of the bus producer.
    Telemetry(SubmitOutcome),
    /// Mode command accepted.
    Mode(SourceMode),
    /// Topic is neither the data nor the mode topic.
    Unrouted,
}

/// Push-transport handler: data topic to the arbitrator, mode topic to `set_source`.
#[derive(Debug, Clone)]
pub struct BusRouter {
    arbitrator: IngestArbitrator,
    data_topic: String,
    mode_topic: String,
    telemetry: EngineTelemetry,
}

impl BusRouter {
    /// Creates a router for the given topics.
    #[must_use]
    pub fn new(
        arbitrator: IngestArbitrator,
        data_topic: impl Into<String>,
        mode_topic: impl Into<String>,
        telemetry: EngineTelemetry,
    ) -> Self {
        Self {
            arbitrator,
            data_topic: data_topic.into(),
            mode_topic: mode_topic.into(),
            telemetry,
        }
    }

    /// Subscription filters this router needs.
    #[must_use]
    pub fn filters(&self) -> Vec<String> {
        vec![self.data_topic.clone(), self.mode_topic.clone()]
    }

    /// Routes one message.
    pub fn route(&self, message: &BusMessage) -> Result<RouteOutcome, IngestError> {
        if message.topic == self.mode_topic {
            let value = String::from_utf8_lossy(&message.payload);
            return self.arbitrator.set_source(&value).map(RouteOutcome::Mode);
        }
        if message.topic == self.data_topic {
            let fields = parse_payload(&message.payload)?;
            return Ok(RouteOutcome::Telemetry(
                self.arbitrator.submit(SourceMode::MessageBus, &fields),
            ));
        }
        Ok(RouteOutcome::Unrouted)
    }
}

impl BusHandler for BusRouter {
    fn handle(&self, message: &BusMessage) {
        // Invalid mode commands are already logged by the arbitrator.
        if let Err(IngestError::MalformedPayload(reason)) = self.route(message) {
            let _ = self.telemetry.log(
                LogLevel::Warn,
                "ingest.malformed",
                json!({ "origin": "message_bus", "topic": message.topic, "error": reason }),
            );
        }
    }
}

/// Response produced by the request transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// HTTP-style status code.
    pub status: u16,
    /// JSON body.
    pub body: Value,
}

impl Reply {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn bad_request(err: impl std::fmt::Display) -> Self {
        Self {
            status: 400,
            body: json!({ "ok": false, "err": err.to_string() }),
        }
    }
}

/// Request transport, independent of any HTTP server.
#[derive(Debug, Clone)]
pub struct RequestGateway {
    arbitrator: IngestArbitrator,
    archive: Option<ArchiveRecorder>,
    telemetry: EngineTelemetry,
}

impl RequestGateway {
    /// Creates a gateway.
    #[must_use]
    pub fn new(arbitrator: IngestArbitrator, telemetry: EngineTelemetry) -> Self {
        Self {
            arbitrator,
            archive: None,
            telemetry,
        }
    }

    /// Also archives every well-formed body, whichever source is authoritative.
    #[must_use]
    pub fn with_archive(mut self, recorder: ArchiveRecorder) -> Self {
        self.archive = Some(recorder);
        self
    }

    /// Handles a POSTed body.
    #[must_use]
    pub fn ingest(&self, body: &[u8]) -> Reply {
        match parse_payload(body) {
            Ok(fields) => {
                if let Some(recorder) = &self.archive {
                    recorder.observe(SourceMode::Request, body);
                }
                let outcome = self.arbitrator.submit(SourceMode::Request, &fields);
                let applied = !matches!(outcome, SubmitOutcome::Ignored { .. });
                Reply::ok(json!({
                    "ok": true,
                    "mode": self.arbitrator.source().as_str(),
                    "applied": applied,
                }))
            }
            Err(err) => {
                let _ = self.telemetry.log(
                    LogLevel::Warn,
                    "ingest.malformed",
                    json!({ "origin": "request", "error": err.to_string() }),
                );
                Reply::bad_request(err)
            }
        }
    }

    /// Read-only health probe.
    #[must_use]
    pub fn health(&self) -> Reply {
        Reply::ok(json!({ "ok": true, "mode": self.arbitrator.source().as_str() }))
    }
}

/// Publishes configuration commands to the sensor board.
#[derive(Clone)]
pub struct DeviceCommander {
    publisher: Arc<dyn BusPublisher>,
    sampling_rate_topic: String,
    motion_alert_topic: String,
    telemetry: EngineTelemetry,
}

impl std::fmt::Debug for DeviceCommander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCommander")
            .field("sampling_rate_topic", &self.sampling_rate_topic)
            .field("motion_alert_topic", &self.motion_alert_topic)
            .finish_non_exhaustive()
    }
}

impl DeviceCommander {
    /// Creates a commander publishing on the given topics.
    #[must_use]
    pub fn new(
        publisher: Arc<dyn BusPublisher>,
        sampling_rate_topic: impl Into<String>,
        motion_alert_topic: impl Into<String>,
        telemetry: EngineTelemetry,
    ) -> Self {
        Self {
            publisher,
            sampling_rate_topic: sampling_rate_topic.into(),
            motion_alert_topic: motion_alert_topic.into(),
            telemetry,
        }
    }

    /// Sets the board's sampling period in seconds.
    pub fn set_sampling_rate(&self, seconds: u32) -> Result<()> {
        self.send(&self.sampling_rate_topic, seconds)
    }

    /// Sets the board's motion alert threshold.
    pub fn set_motion_alert(&self, threshold: u32) -> Result<()> {
        self.send(&self.motion_alert_topic, threshold)
    }

    fn send(&self, topic: &str, value: u32) -> Result<()> {
        self.publisher
            .publish(BusMessage::new(topic, value.to_string()))?;
        let _ = self.telemetry.log(
            LogLevel::Info,
            "device.command",
            json!({ "topic": topic, "value": value }),
        );
        Ok(())
    }
}

/// Bounded exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Starts at `min` and doubles up to `max`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Delay to wait now; the next call waits longer.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Back to `min` after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(5))
    }
}

/// Counters returned when a supervisor exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Successful connections.
    pub connections: u64,
    /// Messages handed to the handler.
    pub messages: u64,
    /// Failed connection attempts.
    pub failures: u64,
}

/// Keeps one subscription alive until cancelled, reconnecting with backoff.
pub struct BusSupervisor {
    name: String,
    connector: Arc<dyn BusConnector>,
    handler: Arc<dyn BusHandler>,
    filters: Vec<String>,
    backoff: Backoff,
    telemetry: EngineTelemetry,
}

impl std::fmt::Debug for BusSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSupervisor")
            .field("name", &self.name)
            .field("filters", &self.filters)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl BusSupervisor {
    /// Creates a supervisor with the default backoff.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn BusConnector>,
        handler: Arc<dyn BusHandler>,
        filters: Vec<String>,
        telemetry: EngineTelemetry,
    ) -> Self {
        Self {
            name: name.into(),
            connector,
            handler,
            filters,
            backoff: Backoff::default(),
            telemetry,
        }
    }

    /// Overrides the reconnect backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs on the tokio runtime until `shutdown` turns true or its sender is dropped.
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<SupervisorStats> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SupervisorStats {
        let mut stats = SupervisorStats::default();
        loop {
            let connected = tokio::select! {
                result = self.connector.connect(&self.filters) => result,
                () = cancelled(&mut shutdown) => break,
            };
            match connected {
                Ok(mut subscription) => {
                    stats.connections += 1;
                    self.backoff.reset();
                    let _ = self.telemetry.log(
                        LogLevel::Info,
                        "bus.connected",
                        json!({ "name": self.name, "filters": self.filters }),
                    );
                    loop {
                        tokio::select! {
                            message = subscription.next() => match message {
                                Some(message) => {
                                    stats.messages += 1;
                                    self.handler.handle(&message);
                                }
                                None => break,
                            },
                            () = cancelled(&mut shutdown) => return stats,
                        }
                    }
                    let _ = self.telemetry.log(
                        LogLevel::Warn,
                        "bus.disconnected",
                        json!({ "name": self.name, "lagged": subscription.lagged() }),
                    );
                }
                Err(err) => {
                    stats.failures += 1;
                    let _ = self.telemetry.log(
                        LogLevel::Warn,
                        "bus.disconnected",
                        json!({ "name": self.name, "error": err.to_string() }),
                    );
                }
            }
            let delay = self.backoff.next_delay();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancelled(&mut shutdown) => break,
            }
        }
        stats
    }
}

/// Resolves once the signal is true or its sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{archive::MeasurementArchive, state::SharedEnvironment};
    use parking_lot::Mutex;
    use shared_logging::MemoryLogSink;
    use shared_message_bus::MemoryBus;

    const DATA: &str = "smartart/sensordata";
    const MODE: &str = "smartart/cmd/mode";

    fn wiring(source: SourceMode) -> (IngestArbitrator, EngineTelemetry, Arc<MemoryLogSink>) {
        let sink = Arc::new(MemoryLogSink::new(64));
        let telemetry = EngineTelemetry::builder("transport")
            .sink(sink.clone())
            .build()
            .unwrap();
        let arbitrator = IngestArbitrator::new(SharedEnvironment::new(source), telemetry.clone());
        (arbitrator, telemetry, sink)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<BusMessage>>);

    impl BusHandler for Recorder {
        fn handle(&self, message: &BusMessage) {
            self.0.lock().push(message.clone());
        }
    }

    impl Recorder {
        fn len(&self) -> usize {
            self.0.lock().len()
        }
    }

    async fn publish_until_seen(bus: &MemoryBus, recorder: &Recorder, seen: usize) {
        for _ in 0..200 {
            if recorder.len() >= seen {
                return;
            }
            bus.publish(BusMessage::new(DATA, "{\"light\": 1}")).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("message never delivered");
    }

    #[test]
    fn router_dispatches_by_topic() {
        let (arbitrator, telemetry, sink) = wiring(SourceMode::MessageBus);
        let router = BusRouter::new(arbitrator.clone(), DATA, MODE, telemetry);
        let outcome = router
            .route(&BusMessage::new(DATA, " {\"temperature\": 30, \"motion\": 1}\n"))
            .unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Telemetry(SubmitOutcome::Applied { motion_armed: true })
        );
        assert_eq!(
            router.route(&BusMessage::new(MODE, "Request\n")).unwrap(),
            RouteOutcome::Mode(SourceMode::Request)
        );
        assert_eq!(
            router.route(&BusMessage::new("other/topic", "x")).unwrap(),
            RouteOutcome::Unrouted
        );

        router.handle(&BusMessage::new(DATA, "[1,2]"));
        router.handle(&BusMessage::new(MODE, "mqtt"));
        assert_eq!(sink.count("ingest.malformed"), 1);
        assert_eq!(sink.count("mode.rejected"), 1);
        assert_eq!(arbitrator.source(), SourceMode::Request);
    }

    #[test]
    fn gateway_replies() {
        let (arbitrator, telemetry, _) = wiring(SourceMode::MessageBus);
        let gateway = RequestGateway::new(arbitrator.clone(), telemetry);

        let ignored = gateway.ingest(br#"{"temperature": 30}"#);
        assert_eq!(ignored.status, 200);
        assert_eq!(ignored.body, json!({ "ok": true, "mode": "message_bus", "applied": false }));

        arbitrator.set_source("request").unwrap();
        let applied = gateway.ingest(br#"{"temperature": 30}"#);
        assert_eq!(applied.body["applied"], json!(true));
        assert!((arbitrator.environment().snapshot().temperature - 30.0).abs() < f64::EPSILON);

        let rejected = gateway.ingest(b"[]");
        assert_eq!(rejected.status, 400);
        assert_eq!(rejected.body["ok"], json!(false));
        assert!(rejected.body["err"].is_string());

        assert_eq!(gateway.health().body, json!({ "ok": true, "mode": "request" }));
    }

    #[test]
    fn gateway_archives_bodies_in_either_mode() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(MeasurementArchive::open(dir.path().join("points.jsonl")).unwrap());
        let (arbitrator, telemetry, sink) = wiring(SourceMode::MessageBus);
        let recorder = ArchiveRecorder::new(archive.clone(), DATA, telemetry.clone());
        let gateway = RequestGateway::new(arbitrator, telemetry).with_archive(recorder);

        let full = br#"{"temperature": 21, "humidity": 40, "light": 700, "motion": 0}"#;
        assert_eq!(gateway.ingest(full).body["applied"], json!(false));
        assert_eq!(gateway.ingest(br#"{"light": 5}"#).status, 200);
        assert_eq!(gateway.ingest(b"[]").status, 400);

        assert_eq!(sink.count("archive.written"), 1);
        assert_eq!(sink.count("archive.rejected"), 1);
        let content = std::fs::read_to_string(archive.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("\"light\":700"));
    }

    #[test]
    fn commander_publishes_decimal_strings() {
        let bus = Arc::new(MemoryBus::new(8));
        let commander = DeviceCommander::new(
            bus.clone(),
            "smartart/cmd/sampling_rate",
            "smartart/cmd/motion_alert",
            EngineTelemetry::disabled("device"),
        );
        commander.set_sampling_rate(5).unwrap();
        commander.set_motion_alert(3).unwrap();
        let sent = bus.snapshot();
        assert_eq!(sent[0].topic, "smartart/cmd/sampling_rate");
        assert_eq!(sent[0].text().unwrap(), "5");
        assert_eq!(sent[1].text().unwrap(), "3");
    }

    #[test]
    fn backoff_doubles_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn supervisor_reconnects_until_cancelled() {
        let bus = Arc::new(MemoryBus::new(64));
        bus.set_offline(true);
        let recorder = Arc::new(Recorder::default());
        let (_, telemetry, sink) = wiring(SourceMode::MessageBus);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = BusSupervisor::new(
            "display",
            bus.clone(),
            recorder.clone(),
            vec![DATA.to_string()],
            telemetry,
        )
        .with_backoff(Backoff::new(Duration::from_millis(5), Duration::from_millis(20)))
        .spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        bus.set_offline(false);
        publish_until_seen(&bus, &recorder, 1).await;

        bus.drop_connections();
        let before = recorder.len();
        publish_until_seen(&bus, &recorder, before + 1).await;

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert!(stats.failures >= 1);
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.messages, recorder.len() as u64);
        assert_eq!(sink.count("bus.connected"), 2);
    }

    #[tokio::test]
    async fn supervisor_stops_when_signal_sender_drops() {
        let bus = Arc::new(MemoryBus::new(8));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = BusSupervisor::new(
            "mode",
            bus,
            Arc::new(Recorder::default()),
            vec![MODE.to_string()],
            EngineTelemetry::disabled("transport"),
        )
        .spawn(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(shutdown_tx);
        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.connections, 1);
    }
}
