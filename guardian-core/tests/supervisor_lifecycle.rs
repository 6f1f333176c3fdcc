//! End-to-end supervisor lifecycle against scripted decoder streams:
//! start, detect, degrade, reload, reset, shut down.

use std::sync::Arc;
use std::time::Duration;

use guardian_config::ConfigManager;
use guardian_config::models::{CameraConfig, ChannelOverrides, GuardianConfig, MotionOverrides};
use guardian_core::events::EventBus;
use guardian_core::health::{HealthAggregator, ServiceHealth};
use guardian_core::metrics::MetricsRegistry;
use guardian_core::source::testing::{ScriptedLauncher, StreamScript};
use guardian_core::supervisor::{Supervisor, SupervisorOptions, SupervisorState};
use guardian_model::ChannelKind;

fn surveillance_config() -> GuardianConfig {
    let mut config = GuardianConfig::default();
    config.video.width = 8;
    config.video.height = 8;
    // Fast-recovery timings so the test observes restarts quickly.
    let overrides = ChannelOverrides {
        restart_delay_ms: Some(20),
        restart_max_delay_ms: Some(100),
        restart_jitter_factor: Some(0.0),
        ..ChannelOverrides::default()
    };
    config.video.cameras.push(CameraConfig {
        id: "lobby".into(),
        channel: Some("lobby".into()),
        input: "rtsp://cams/lobby".into(),
        overrides: overrides.clone(),
    });
    config.video.cameras.push(CameraConfig {
        id: "garage".into(),
        channel: Some("garage".into()),
        input: "rtsp://cams/garage".into(),
        overrides,
    });
    config
}

struct Fixture {
    supervisor: Arc<Supervisor>,
    manager: Arc<ConfigManager>,
    launcher: Arc<ScriptedLauncher>,
    metrics: Arc<MetricsRegistry>,
    bus: Arc<EventBus>,
}

fn fixture(script: StreamScript) -> Fixture {
    let launcher = Arc::new(ScriptedLauncher::repeating(script));
    let manager = Arc::new(ConfigManager::from_value(surveillance_config()).unwrap());
    let metrics = Arc::new(MetricsRegistry::new());
    let bus = Arc::new(EventBus::default());
    let supervisor = Arc::new(Supervisor::new(
        manager.clone(),
        launcher.clone(),
        metrics.clone(),
        bus.clone(),
        SupervisorOptions {
            shutdown_timeout: Duration::from_secs(5),
            hook_timeout: Duration::from_millis(200),
        },
    ));
    Fixture {
        supervisor,
        manager,
        launcher,
        metrics,
        bus,
    }
}

#[tokio::test]
async fn full_lifecycle_start_degrade_reload_stop() {
    // Streams that die immediately: every channel keeps recovering.
    let f = fixture(StreamScript::immediate_eof());
    let health = HealthAggregator::new(f.supervisor.clone(), f.metrics.clone());

    f.supervisor.start().await.unwrap();
    assert_eq!(f.supervisor.state(), SupervisorState::Running);
    assert_eq!(f.supervisor.pipeline_count().await, 2);

    // Restarts accumulate in the registry.
    let mut restarts = 0;
    for _ in 0..200 {
        restarts = f
            .metrics
            .snapshot()
            .pipelines
            .get(&ChannelKind::Video)
            .map(|m| m.totals.restarts)
            .unwrap_or(0);
        if restarts >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(restarts >= 4, "expected restarts, saw {restarts}");

    // Hot reload touching only one channel's detector config.
    let mut next = surveillance_config();
    next.video.cameras[0].overrides.motion = Some(MotionOverrides {
        area_threshold: Some(5.0),
        ..MotionOverrides::default()
    });
    f.manager.replace(next).unwrap();
    let summary = f.supervisor.apply_reload().await.unwrap();
    assert_eq!(summary.updated, vec!["video:lobby"]);
    assert!(summary.restarted.is_empty());

    let report = health.report().await;
    assert_eq!(report.state, SupervisorState::Running);
    assert_eq!(report.runtime.pipelines.video_channels, 2);

    let shutdown = f.supervisor.stop(Some("test over"), None).await;
    assert_eq!(shutdown.last_reason.as_deref(), Some("test over"));
    assert_eq!(f.supervisor.state(), SupervisorState::Stopped);
    assert_eq!(health.report().await.status, ServiceHealth::Stopping);
}

#[tokio::test]
async fn frames_reach_detectors_and_events_reach_subscribers() {
    // A camera that alternates a quiet lobby with a sudden bright scene.
    let quiet = vec![40u8; 64];
    let mut bright = vec![40u8; 64];
    for pixel in bright.iter_mut().take(32) {
        *pixel = 200;
    }
    let mut payloads = vec![quiet.clone(); 8];
    payloads.extend(vec![bright; 10]);
    let mut steps: Vec<Vec<u8>> = payloads;
    // Keep the stream alive after the burst so the watchdog stays quiet.
    steps.extend(vec![quiet; 4]);

    let f = fixture(StreamScript::payloads_then_silence(steps));
    let mut events = f.bus.subscribe();

    // Make motion eager enough to fire within the burst.
    let mut config = surveillance_config();
    for camera in &mut config.video.cameras {
        camera.overrides.motion = Some(MotionOverrides {
            warmup_frames: Some(0),
            debounce_frames: Some(1),
            min_interval_ms: Some(0),
            idle_rebaseline_ms: Some(0),
            ..MotionOverrides::default()
        });
    }
    f.manager.replace(config).unwrap();

    f.supervisor.start().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("a motion event within the burst")
        .expect("bus open");
    assert_eq!(event.detector, guardian_model::DetectorKind::Motion);
    assert!(event.source.starts_with("video:"));
    assert!(event.meta.contains_key("areaAdaptiveThreshold"));

    f.supervisor.stop(None, None).await;
}

#[tokio::test]
async fn circuit_breaker_reset_is_operator_visible() {
    // Low circuit threshold: channels fail into circuit-open quickly.
    let mut config = surveillance_config();
    for camera in &mut config.video.cameras {
        camera.overrides.circuit_breaker_threshold = Some(2);
    }
    let f = fixture(StreamScript::immediate_eof());
    f.manager.replace(config).unwrap();

    f.supervisor.start().await.unwrap();

    // Wait for at least one breaker to open.
    let mut opened = false;
    for _ in 0..200 {
        if f.metrics.counter("pipeline.video:lobby.circuitOpen") > 0 {
            opened = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(opened, "circuit breaker never opened");

    // Raw channel id resolves; reset closes the breaker and restarts.
    assert!(f.supervisor.reset_circuit_breaker("lobby").await);
    // Immediately after a reset the breaker is closed again.
    assert!(!f.supervisor.reset_circuit_breaker("lobby").await);
    assert!(f.launcher.launches() > 2);

    f.supervisor.stop(None, None).await;
}
