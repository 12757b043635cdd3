//! Per-cooler control mode state.
//!
//! A [`CoolerState`] tracks which cooling mode is in force for one cooler and
//! turns mode requests into queued device changes. Exactly one mode is active
//! at a time: switching modes first stops and joins the previous mode's
//! machinery (the software-curve task in particular), so a stale curve
//! evaluation can never land after a newer request.

use std::sync::Arc;

use anyhow::{bail, Result};
use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::WatchEnd;
use crate::cooler::{CoolerInfo, CoolingMode};
use crate::cooling_change::{ChangeKind, ChangePool, ChangeSender};
use crate::curve::PowerCurve;
use crate::sensor_service::SensorService;

/// Parameters of a host-evaluated curve mode.
#[derive(Clone)]
pub(crate) struct SoftwareCurveConfig {
    pub(crate) sensor_device_id: Uuid,
    pub(crate) sensor_id: Uuid,
    pub(crate) fallback_power: u8,
    pub(crate) curve: PowerCurve,
}

struct CurveRunner {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CurveRunner {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

enum ActiveMode {
    NotConfigured,
    Automatic,
    Manual {
        power: u8,
    },
    SoftwareCurve {
        config: SoftwareCurveConfig,
        /// Present while the device is online.
        runner: Option<CurveRunner>,
    },
    HardwareCurve {
        sensor_id: Uuid,
        curve: PowerCurve,
    },
}

struct CoolerRuntime {
    /// Change queue of the owning device; `None` while offline.
    changes: Option<ChangeSender>,
    active: ActiveMode,
}

pub(crate) struct CoolerState {
    device_id: Uuid,
    info: CoolerInfo,
    sensor_service: Arc<SensorService>,
    pool: Arc<ChangePool>,
    runtime: tokio::sync::Mutex<CoolerRuntime>,
}

impl CoolerState {
    pub(crate) fn new(
        device_id: Uuid,
        info: CoolerInfo,
        sensor_service: Arc<SensorService>,
        pool: Arc<ChangePool>,
    ) -> Self {
        Self {
            device_id,
            info,
            sensor_service,
            pool,
            runtime: tokio::sync::Mutex::new(CoolerRuntime {
                changes: None,
                active: ActiveMode::NotConfigured,
            }),
        }
    }

    pub(crate) async fn set_automatic(&self) -> Result<()> {
        if !self.info.supported_modes.automatic {
            bail!("cooler {} has no automatic mode", self.info.cooler_id);
        }
        let mut runtime = self.runtime.lock().await;
        Self::stop_active(&mut runtime).await;
        runtime.active = ActiveMode::Automatic;
        self.enqueue(&runtime, ChangeKind::Automatic);
        Ok(())
    }

    pub(crate) async fn set_manual_power(&self, power: u8) -> Result<()> {
        if !self.info.supported_modes.manual {
            bail!("cooler {} has no manual mode", self.info.cooler_id);
        }
        let power = self.effective_power(power)?;
        let mut runtime = self.runtime.lock().await;
        Self::stop_active(&mut runtime).await;
        runtime.active = ActiveMode::Manual { power };
        self.enqueue(&runtime, ChangeKind::Manual { power });
        Ok(())
    }

    pub(crate) async fn set_software_curve(&self, config: SoftwareCurveConfig) -> Result<()> {
        // A software curve drives the cooler through manual power commands.
        if !self.info.supported_modes.manual {
            bail!(
                "cooler {} has no manual mode, software curve unavailable",
                self.info.cooler_id
            );
        }
        let config = SoftwareCurveConfig {
            fallback_power: self.effective_power(config.fallback_power)?,
            ..config
        };
        let mut runtime = self.runtime.lock().await;
        Self::stop_active(&mut runtime).await;
        let runner = runtime
            .changes
            .clone()
            .map(|sender| self.start_runner(config.clone(), sender));
        runtime.active = ActiveMode::SoftwareCurve { config, runner };
        Ok(())
    }

    pub(crate) async fn set_hardware_curve(&self, sensor_id: Uuid, curve: PowerCurve) -> Result<()> {
        if !self.info.supported_modes.hardware_curve {
            bail!("cooler {} has no hardware curve mode", self.info.cooler_id);
        }
        if !self
            .info
            .hardware_curve_input_sensor_ids
            .contains(&sensor_id)
        {
            bail!(
                "sensor {sensor_id} cannot feed the hardware curve of cooler {}",
                self.info.cooler_id
            );
        }
        let mut runtime = self.runtime.lock().await;
        Self::stop_active(&mut runtime).await;
        runtime.active = ActiveMode::HardwareCurve {
            sensor_id,
            curve: curve.clone(),
        };
        self.enqueue(&runtime, ChangeKind::HardwareCurve { sensor_id, curve });
        Ok(())
    }

    /// Applies a previously captured mode, e.g. one restored from storage.
    pub(crate) async fn apply_mode(&self, mode: CoolingMode) -> Result<()> {
        match mode {
            CoolingMode::Automatic => self.set_automatic().await,
            CoolingMode::Manual { power } => self.set_manual_power(power).await,
            CoolingMode::SoftwareCurve {
                sensor_device_id,
                sensor_id,
                fallback_power,
                curve,
            } => {
                self.set_software_curve(SoftwareCurveConfig {
                    sensor_device_id,
                    sensor_id,
                    fallback_power,
                    curve,
                })
                .await
            }
            CoolingMode::HardwareCurve { sensor_id, curve } => {
                self.set_hardware_curve(sensor_id, curve).await
            }
        }
    }

    /// Mode currently in force, if one was ever configured.
    pub(crate) async fn current_mode(&self) -> Option<CoolingMode> {
        let runtime = self.runtime.lock().await;
        match &runtime.active {
            ActiveMode::NotConfigured => None,
            ActiveMode::Automatic => Some(CoolingMode::Automatic),
            ActiveMode::Manual { power } => Some(CoolingMode::Manual { power: *power }),
            ActiveMode::SoftwareCurve { config, .. } => Some(CoolingMode::SoftwareCurve {
                sensor_device_id: config.sensor_device_id,
                sensor_id: config.sensor_id,
                fallback_power: config.fallback_power,
                curve: config.curve.clone(),
            }),
            ActiveMode::HardwareCurve { sensor_id, curve } => Some(CoolingMode::HardwareCurve {
                sensor_id: *sensor_id,
                curve: curve.clone(),
            }),
        }
    }

    /// Attaches the device's change queue and re-applies the mode in force,
    /// so a reconnecting device comes back configured the way it left.
    pub(crate) async fn set_online(&self, sender: ChangeSender) {
        let mut runtime = self.runtime.lock().await;
        runtime.changes = Some(sender.clone());
        let reissue = match &mut runtime.active {
            ActiveMode::NotConfigured => None,
            ActiveMode::Automatic => Some(ChangeKind::Automatic),
            ActiveMode::Manual { power } => Some(ChangeKind::Manual { power: *power }),
            ActiveMode::SoftwareCurve { config, runner } => {
                let restarted = self.start_runner(config.clone(), sender);
                if let Some(previous) = runner.replace(restarted) {
                    // Should have been stopped at offline time.
                    previous.cancel.cancel();
                }
                None
            }
            ActiveMode::HardwareCurve { sensor_id, curve } => Some(ChangeKind::HardwareCurve {
                sensor_id: *sensor_id,
                curve: curve.clone(),
            }),
        };
        if let Some(kind) = reissue {
            self.enqueue(&runtime, kind);
        }
    }

    /// Detaches the change queue and parks the software-curve task, keeping
    /// the configured mode for the device's return.
    pub(crate) async fn set_offline(&self) {
        let mut runtime = self.runtime.lock().await;
        runtime.changes = None;
        if let ActiveMode::SoftwareCurve { runner, .. } = &mut runtime.active {
            if let Some(runner) = runner.take() {
                runner.stop().await;
            }
        }
    }

    async fn stop_active(runtime: &mut CoolerRuntime) {
        if let ActiveMode::SoftwareCurve { runner, .. } = &mut runtime.active {
            if let Some(runner) = runner.take() {
                runner.stop().await;
            }
        }
        runtime.active = ActiveMode::NotConfigured;
    }

    fn enqueue(&self, runtime: &CoolerRuntime, kind: ChangeKind) {
        if let Some(sender) = &runtime.changes {
            sender.send(self.pool.acquire(self.info.cooler_id, kind));
        }
    }

    /// Clamps a requested power into the cooler's accepted range.
    fn effective_power(&self, power: u8) -> Result<u8> {
        if power > 100 {
            bail!("cooling power {power} exceeds 100 percent");
        }
        let Some(limits) = self.info.power_limits else {
            return Ok(power);
        };
        if power == 0 && limits.can_switch_off {
            return Ok(0);
        }
        Ok(power.max(limits.minimum_power))
    }

    fn start_runner(&self, config: SoftwareCurveConfig, sender: ChangeSender) -> CurveRunner {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_software_curve(
            self.device_id,
            self.info.cooler_id,
            config,
            self.sensor_service.clone(),
            self.pool.clone(),
            sender,
            cancel.clone(),
        ));
        CurveRunner { cancel, task }
    }
}

/// Drives one cooler from one sensor through a curve.
///
/// The loop applies the fallback power first, then waits for the source
/// sensor, replays its last known value through the curve, and follows the
/// live stream. A disconnect of the source device drops back to the fallback
/// and waits for it to return.
async fn run_software_curve(
    device_id: Uuid,
    cooler_id: Uuid,
    config: SoftwareCurveConfig,
    sensor_service: Arc<SensorService>,
    pool: Arc<ChangePool>,
    sender: ChangeSender,
    cancel: CancellationToken,
) {
    let send_power = |power: u8| {
        sender.send(pool.acquire(cooler_id, ChangeKind::Manual { power }));
    };
    loop {
        send_power(config.fallback_power);
        if !sensor_service
            .wait_for_sensor(config.sensor_device_id, config.sensor_id, &cancel)
            .await
        {
            return;
        }
        let mut watch =
            match sensor_service.watch_values(config.sensor_device_id, config.sensor_id) {
                Ok(watch) => watch,
                Err(err) => {
                    // The sensor vanished between the wait and the watch.
                    if cancel.is_cancelled() {
                        return;
                    }
                    debug!(
                        "curve source {} of cooler {cooler_id} raced away: {err:#}",
                        config.sensor_id
                    );
                    continue;
                }
            };
        debug!(
            "cooler {cooler_id} of device {device_id} now follows sensor {}",
            config.sensor_id
        );
        if let Some(point) =
            sensor_service.last_known_value(config.sensor_device_id, config.sensor_id)
        {
            send_power(config.curve.evaluate(point.value.to_f64()));
        }
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                next = watch.next() => match next {
                    Ok(point) => send_power(config.curve.evaluate(point.value.to_f64())),
                    Err(WatchEnd::DeviceDisconnected) => {
                        warn!(
                            "curve source device {} disconnected, cooler {cooler_id} falls back",
                            config.sensor_device_id
                        );
                        break;
                    }
                    Err(WatchEnd::Closed) => return,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooler::{CoolerPowerLimits, CoolerType, SupportedCoolingModes};
    use crate::curve::{ControlCurve, CurvePoint, Monotonicity};
    use pretty_assertions::assert_eq;

    fn full_info() -> CoolerInfo {
        CoolerInfo {
            cooler_id: Uuid::new_v4(),
            speed_sensor_id: None,
            kind: CoolerType::Fan,
            supported_modes: SupportedCoolingModes {
                automatic: true,
                manual: true,
                hardware_curve: false,
            },
            power_limits: Some(CoolerPowerLimits {
                minimum_power: 20,
                can_switch_off: true,
            }),
            hardware_curve_input_sensor_ids: Vec::new(),
        }
    }

    fn state(info: CoolerInfo) -> CoolerState {
        let scheduler = Arc::new(crate::scheduler::PollingScheduler::new(
            std::time::Duration::from_secs(1),
        ));
        let store = Arc::new(crate::config_store::MemoryConfigStore::new());
        let bus = crate::driver::DeviceEventBus::new();
        let sensor_service = SensorService::new(scheduler, store, &bus);
        CoolerState::new(Uuid::new_v4(), info, sensor_service, ChangePool::new())
    }

    #[tokio::test]
    async fn unsupported_modes_are_rejected_synchronously() {
        let mut info = full_info();
        info.supported_modes = SupportedCoolingModes {
            automatic: true,
            manual: false,
            hardware_curve: false,
        };
        let cooler = state(info);
        assert!(cooler.set_manual_power(50).await.is_err());
        assert!(
            cooler
                .set_software_curve(SoftwareCurveConfig {
                    sensor_device_id: Uuid::new_v4(),
                    sensor_id: Uuid::new_v4(),
                    fallback_power: 30,
                    curve: ControlCurve::new(
                        vec![CurvePoint::new(0.0, 0), CurvePoint::new(100.0, 100)],
                        Monotonicity::IncreasingUpTo100,
                    )
                    .unwrap(),
                })
                .await
                .is_err()
        );
        assert!(cooler.set_hardware_curve(
            Uuid::new_v4(),
            ControlCurve::new(vec![CurvePoint::new(0.0, 0)], Monotonicity::Any).unwrap()
        )
        .await
        .is_err());
        // The failed requests left no mode behind.
        assert_eq!(cooler.current_mode().await, None);
    }

    #[tokio::test]
    async fn manual_power_is_clamped_into_the_supported_range() {
        let cooler = state(full_info());
        cooler.set_manual_power(5).await.unwrap();
        assert_eq!(
            cooler.current_mode().await,
            Some(CoolingMode::Manual { power: 20 })
        );
        // Zero stays zero because the cooler can switch off.
        cooler.set_manual_power(0).await.unwrap();
        assert_eq!(
            cooler.current_mode().await,
            Some(CoolingMode::Manual { power: 0 })
        );
        assert!(cooler.set_manual_power(101).await.is_err());
    }

    #[tokio::test]
    async fn configured_mode_survives_an_offline_period() {
        let cooler = state(full_info());
        cooler.set_manual_power(60).await.unwrap();
        cooler.set_offline().await;
        assert_eq!(
            cooler.current_mode().await,
            Some(CoolingMode::Manual { power: 60 })
        );
    }

    #[tokio::test]
    async fn hardware_curve_requires_a_listed_input_sensor() {
        let sensor_id = Uuid::new_v4();
        let mut info = full_info();
        info.supported_modes.hardware_curve = true;
        info.hardware_curve_input_sensor_ids = vec![sensor_id];
        let cooler = state(info);
        let curve = ControlCurve::new(
            vec![CurvePoint::new(0.0, 0), CurvePoint::new(100.0, 100)],
            Monotonicity::IncreasingUpTo100,
        )
        .unwrap();

        assert!(cooler
            .set_hardware_curve(Uuid::new_v4(), curve.clone())
            .await
            .is_err());
        cooler.set_hardware_curve(sensor_id, curve.clone()).await.unwrap();
        assert_eq!(
            cooler.current_mode().await,
            Some(CoolingMode::HardwareCurve { sensor_id, curve })
        );
    }
}
