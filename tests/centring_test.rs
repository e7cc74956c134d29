//! Diffractometer beam centring.
//!
//! Convergence logic is exercised with a scripted pin locator that parks the
//! sample stage at predetermined edge heights; the full procedure runs
//! against the simulated diffractometer.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use beamline_align::error::{AlignError, AlignResult};
use beamline_align::experiment::run_engine::{EngineMessage, MoveOptions, RunEngine};
use beamline_align::hardware::capabilities::Movable;
use beamline_align::hardware::mock::{DiffractometerScene, SimulatedDiffractometer};
use beamline_align::hardware::registry::DeviceRegistry;
use beamline_align::procedures::centring::{
    beam_on_centre_diffractometer, beam_on_centre_diffractometer_with, beam_on_pin,
    centre_det_angles, move_pin_origin, CentringConfig, CentringDevices, PinLocator,
    PinScanConfig, PIN_ORIGIN_GROUP,
};

/// Moves the stage to the next scripted edge height on every call.
struct ScriptedLocator {
    heights: Mutex<Vec<f64>>,
    calls: Mutex<Vec<f64>>,
}

impl ScriptedLocator {
    fn new(heights: &[f64]) -> Self {
        let mut heights = heights.to_vec();
        heights.reverse();
        Self {
            heights: Mutex::new(heights),
            calls: Mutex::new(Vec::new()),
        }
    }

    async fn half_cuts(&self) -> Vec<f64> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PinLocator for ScriptedLocator {
    async fn locate(&self, engine: &RunEngine, devices: &CentringDevices, half_cut: f64) -> AlignResult<()> {
        self.calls.lock().await.push(half_cut);
        let next = self
            .heights
            .lock()
            .await
            .pop()
            .unwrap_or_else(|| panic!("locator called more often than scripted"));
        engine
            .move_to(&devices.sample_y, next, MoveOptions::wait())
            .await
    }
}

fn simulated(scene: DiffractometerScene) -> (RunEngine, SimulatedDiffractometer) {
    let mut registry = DeviceRegistry::new();
    let sim = SimulatedDiffractometer::build(scene, &CentringDevices::default(), &mut registry).unwrap();
    (RunEngine::new(Arc::new(registry)).with_journal(), sim)
}

#[tokio::test]
async fn test_converges_after_five_corrections() {
    let (engine, sim) = simulated(DiffractometerScene::default());
    let locator = ScriptedLocator::new(&[-2.0, 1.0, 0.7, 0.5, 0.3, 0.1, -0.5]);

    let report = beam_on_centre_diffractometer_with(
        &engine,
        &CentringDevices::default(),
        &CentringConfig::default(),
        &locator,
    )
    .await
    .unwrap();

    assert_eq!(report.iterations, 5);
    assert_eq!(report.y_0, -2.0);
    assert_eq!(report.y_180, -0.5);
    assert_eq!(report.middle, -0.5);
    // Each 180° locate starts from the previous edge height
    assert_eq!(locator.half_cuts().await, vec![1.0, -2.0, 1.0, 0.7, 0.5, 0.3, 0.1]);
    // 0.01 * (1.5 + 1.2 + 1.0 + 0.8 + 0.6)
    assert!((sim.mirror_height.position().await.unwrap() - 0.051).abs() < 1e-9);
    assert_eq!(sim.rotation.position().await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_converges_after_three_corrections() {
    let (engine, _sim) = simulated(DiffractometerScene::default());
    let locator = ScriptedLocator::new(&[-2.0, 5.0, 0.7, 0.5, 1.5]);

    let report = beam_on_centre_diffractometer_with(
        &engine,
        &CentringDevices::default(),
        &CentringConfig::default(),
        &locator,
    )
    .await
    .unwrap();

    assert_eq!(report.iterations, 3);
    assert_eq!(report.middle, 1.5);
    assert_eq!(locator.half_cuts().await.len(), 5);
}

#[tokio::test]
async fn test_gives_up_after_iteration_cap() {
    let (engine, sim) = simulated(DiffractometerScene::default());
    let locator = ScriptedLocator::new(&[0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);

    let err = beam_on_centre_diffractometer_with(
        &engine,
        &CentringDevices::default(),
        &CentringConfig::default(),
        &locator,
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains('5'), "{err}");
    match err {
        AlignError::ConvergenceExceeded { iterations } => assert_eq!(iterations, 5),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(locator.half_cuts().await.len(), 7);
    // Rotation is left where the failure happened
    assert_eq!(sim.rotation.position().await.unwrap(), 180.0);
}

#[tokio::test]
async fn test_configured_cap_and_acceptance() {
    let (engine, _sim) = simulated(DiffractometerScene::default());
    let config = CentringConfig {
        max_iterations: 1,
        mirror_diff_acceptance: 0.3,
        ..CentringConfig::default()
    };
    // middle = 0.5, first deviation 0.5, after one correction 0.45 > 0.3
    let locator = ScriptedLocator::new(&[0.0, 1.0, 0.95]);

    let err = beam_on_centre_diffractometer_with(&engine, &CentringDevices::default(), &config, &locator)
        .await
        .unwrap_err();

    assert!(matches!(err, AlignError::ConvergenceExceeded { iterations: 1 }));
}

#[tokio::test]
async fn test_move_pin_origin_issues_three_moves_and_one_wait() {
    let (engine, sim) = simulated(DiffractometerScene::default());
    let devices = CentringDevices::default();
    sim.sample_x.move_abs(0.3).await.unwrap();
    sim.sample_y.move_abs(-0.2).await.unwrap();
    sim.sample_z.move_abs(1.1).await.unwrap();

    move_pin_origin(&engine, &devices, true, None).await.unwrap();

    let group = Some(PIN_ORIGIN_GROUP.to_string());
    let expected: Vec<EngineMessage> = [&devices.sample_x, &devices.sample_y, &devices.sample_z]
        .into_iter()
        .map(|axis| EngineMessage::Set {
            device: axis.clone(),
            value: 0.0,
            wait: false,
            group: group.clone(),
        })
        .chain([EngineMessage::Wait {
            group: PIN_ORIGIN_GROUP.to_string(),
        }])
        .collect();
    assert_eq!(engine.messages().await, expected);

    for motor in [&sim.sample_x, &sim.sample_y, &sim.sample_z] {
        assert_eq!(motor.position().await.unwrap(), 0.0);
    }
}

#[tokio::test]
async fn test_move_pin_origin_without_wait() {
    let (engine, _sim) = simulated(DiffractometerScene::default());

    move_pin_origin(&engine, &CentringDevices::default(), false, None)
        .await
        .unwrap();

    let messages = engine.messages().await;
    assert_eq!(messages.len(), 3);
    assert!(messages
        .iter()
        .all(|m| matches!(m, EngineMessage::Set { wait: false, group: None, .. })));
    engine.wait_all().await.unwrap();
}

#[tokio::test]
async fn test_detector_angles_centre_on_direct_beam() {
    let scene = DiffractometerScene::default();
    let (engine, sim) = simulated(scene);
    sim.sample_y.move_abs(-2.0).await.unwrap();

    centre_det_angles(&engine, &CentringDevices::default(), &CentringConfig::default())
        .await
        .unwrap();

    let tth = sim.two_theta.position().await.unwrap();
    let alpha = sim.alpha.position().await.unwrap();
    assert!((tth - scene.tth_centre).abs() < 0.02, "tth at {tth}");
    assert!((alpha - scene.alpha_centre).abs() < 0.02, "alpha at {alpha}");
}

#[tokio::test]
async fn test_beam_on_pin_finds_pitch_and_edge() {
    let scene = DiffractometerScene::default();
    let (engine, sim) = simulated(scene);

    let fit = beam_on_pin(&engine, &CentringDevices::default(), &PinScanConfig::default(), 1.0)
        .await
        .unwrap();

    assert!((fit.mirror_pitch - scene.pitch_centre).abs() < 0.02, "pitch at {}", fit.mirror_pitch);
    assert!((fit.stage_y - scene.edge_at_0).abs() < 0.01, "edge at {}", fit.stage_y);
    assert_eq!(sim.sample_y.position().await.unwrap(), fit.stage_y);
    assert_eq!(sim.mirror_pitch.position().await.unwrap(), fit.mirror_pitch);
}

#[tokio::test]
async fn test_simulated_centring_within_acceptance() {
    let scene = DiffractometerScene::default();
    let (engine, sim) = simulated(scene);

    let report = beam_on_centre_diffractometer(&engine, &CentringDevices::default(), &CentringConfig::default())
        .await
        .unwrap();

    assert_eq!(report.iterations, 0);
    assert!((report.y_0 - scene.edge_at_0).abs() < 0.01);
    assert!((report.y_180 - scene.edge_at_180).abs() < 0.01);
    assert!((report.y_180 - report.middle).abs() <= 0.08);
    assert_eq!(sim.mirror_height.position().await.unwrap(), 0.0);
    assert_eq!(sim.rotation.position().await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_simulated_centring_corrects_mirror_height() {
    let scene = DiffractometerScene {
        edge_at_180: 1.2,
        ..DiffractometerScene::default()
    };
    let (engine, sim) = simulated(scene);
    let mut config = CentringConfig::default();
    config.pin_scan.sy_coverage = 0.6;

    let report = beam_on_centre_diffractometer(&engine, &CentringDevices::default(), &config)
        .await
        .unwrap();

    assert_eq!(report.iterations, 1);
    assert!((report.y_180 - report.middle).abs() <= 0.08);
    let height = sim.mirror_height.position().await.unwrap();
    assert!(height > 0.0 && height < 0.002, "mirror height {height}");
    assert_eq!(sim.rotation.position().await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_simulated_centring_on_renamed_devices() {
    let devices = CentringDevices {
        detector: "d11".to_string(),
        sample_y: "sy".to_string(),
        rotation: "th".to_string(),
        mirror_height: "m2_y".to_string(),
        ..CentringDevices::default()
    };
    let mut registry = DeviceRegistry::new();
    let sim = SimulatedDiffractometer::build(DiffractometerScene::default(), &devices, &mut registry).unwrap();
    let engine = RunEngine::new(Arc::new(registry));

    assert!(engine.registry().get_readable("d11").is_some());
    assert!(engine.registry().get_readable("direct_beam_det").is_none());

    let report = beam_on_centre_diffractometer(&engine, &devices, &CentringConfig::default())
        .await
        .unwrap();
    assert_eq!(report.iterations, 0);
    assert_eq!(sim.sample_y.name(), "sy");
    assert_eq!(sim.rotation.position().await.unwrap(), 0.0);
}

#[test]
fn test_simulation_rejects_unpublished_detector_field() {
    let devices = CentringDevices {
        detector_field: "total".to_string(),
        ..CentringDevices::default()
    };
    let mut registry = DeviceRegistry::new();
    let err = SimulatedDiffractometer::build(DiffractometerScene::default(), &devices, &mut registry)
        .err()
        .unwrap();
    assert!(err.to_string().contains("total"), "{err}");
}
