//! Full-stack scenario: a cooler driven by a curve over a sensor on another
//! device, through the real services and the real polling machinery.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use pretty_assertions::assert_eq;
use uuid::Uuid;

use periphd::config_store::MemoryConfigStore;
use periphd::cooler::{CoolerInfo, CoolerType, CoolingMode, SupportedCoolingModes};
use periphd::cooling_service::CoolingService;
use periphd::curve::{ControlCurve, CurvePoint, Monotonicity, PowerCurve};
use periphd::driver::{
    CoolingController, DeviceEvent, DeviceEventBus, DeviceEventKind, DeviceFeatures,
    GroupedQueryFeature, SensorDriver,
};
use periphd::scheduler::PollingScheduler;
use periphd::sensor::{SensorDataPoint, SensorDataType, SensorInfo, SensorKind, SensorValue};
use periphd::sensor_service::SensorService;

/// Batched-read feature of the mock sensor device: one shared temperature,
/// captured per member sensor on each query.
struct GroupedTemperature {
    value: Mutex<f64>,
    members: Mutex<HashSet<Uuid>>,
    captured: Mutex<HashMap<Uuid, f64>>,
}

impl GroupedTemperature {
    fn new(value: f64) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(value),
            members: Mutex::new(HashSet::new()),
            captured: Mutex::new(HashMap::new()),
        })
    }

    fn set_value(&self, value: f64) {
        *self.value.lock().unwrap() = value;
    }
}

#[async_trait::async_trait]
impl GroupedQueryFeature for GroupedTemperature {
    fn add_sensor(&self, sensor_id: Uuid) {
        self.members.lock().unwrap().insert(sensor_id);
    }

    fn remove_sensor(&self, sensor_id: Uuid) {
        self.members.lock().unwrap().remove(&sensor_id);
        self.captured.lock().unwrap().remove(&sensor_id);
    }

    async fn query_values(&self) -> Result<()> {
        let value = *self.value.lock().unwrap();
        let members = self.members.lock().unwrap().clone();
        let mut captured = self.captured.lock().unwrap();
        for member in members {
            captured.insert(member, value);
        }
        Ok(())
    }

    fn last_value(&self, sensor_id: Uuid) -> Option<SensorValue> {
        self.captured
            .lock()
            .unwrap()
            .get(&sensor_id)
            .map(|v| SensorValue::F64(*v))
    }
}

struct TemperatureDevice {
    sensor_id: Uuid,
    feature: Arc<GroupedTemperature>,
}

#[async_trait::async_trait]
impl SensorDriver for TemperatureDevice {
    fn sensors(&self) -> Vec<SensorInfo> {
        vec![SensorInfo {
            sensor_id: self.sensor_id,
            data_type: SensorDataType::F64,
            kind: SensorKind::GroupedPolled,
            scale_minimum: Some(SensorValue::F64(0.0)),
            scale_maximum: Some(SensorValue::F64(100.0)),
        }]
    }

    async fn read_sensor(&self, _sensor_id: Uuid) -> Result<SensorValue> {
        anyhow::bail!("grouped sensors are not read individually")
    }

    async fn stream_values(
        &self,
        _sensor_id: Uuid,
    ) -> Result<futures::stream::BoxStream<'static, SensorDataPoint>> {
        anyhow::bail!("not streamed")
    }

    fn grouped_query(&self) -> Option<Arc<dyn GroupedQueryFeature>> {
        Some(self.feature.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Manual(u8),
    Apply,
}

struct FanController {
    cooler_id: Uuid,
    commands: Mutex<Vec<Command>>,
}

impl FanController {
    fn new(cooler_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            cooler_id,
            commands: Mutex::new(Vec::new()),
        })
    }

    fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    fn manual_powers(&self) -> Vec<u8> {
        self.commands()
            .into_iter()
            .filter_map(|command| match command {
                Command::Manual(power) => Some(power),
                Command::Apply => None,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl CoolingController for FanController {
    fn coolers(&self) -> Vec<CoolerInfo> {
        vec![CoolerInfo {
            cooler_id: self.cooler_id,
            speed_sensor_id: None,
            kind: CoolerType::Fan,
            supported_modes: SupportedCoolingModes {
                automatic: true,
                manual: true,
                hardware_curve: false,
            },
            power_limits: None,
            hardware_curve_input_sensor_ids: Vec::new(),
        }]
    }

    async fn set_automatic(&self, _cooler_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn set_manual_power(&self, _cooler_id: Uuid, power: u8) -> Result<()> {
        self.commands.lock().unwrap().push(Command::Manual(power));
        Ok(())
    }

    async fn set_hardware_curve(
        &self,
        _cooler_id: Uuid,
        _sensor_id: Uuid,
        _curve: &PowerCurve,
    ) -> Result<()> {
        anyhow::bail!("no hardware curves")
    }

    async fn apply_changes(&self) -> Result<()> {
        self.commands.lock().unwrap().push(Command::Apply);
        Ok(())
    }
}

fn identity_curve() -> PowerCurve {
    ControlCurve::new(
        vec![
            CurvePoint::new(0.0, 0),
            CurvePoint::new(50.0, 50),
            CurvePoint::new(100.0, 100),
        ],
        Monotonicity::IncreasingUpTo100,
    )
    .unwrap()
}

struct Stack {
    scheduler: Arc<PollingScheduler>,
    bus: DeviceEventBus,
    sensors: Arc<SensorService>,
    cooling: Arc<CoolingService>,
}

impl Stack {
    fn new() -> Self {
        let scheduler = Arc::new(PollingScheduler::new(Duration::from_millis(5)));
        let store = Arc::new(MemoryConfigStore::new());
        let bus = DeviceEventBus::new();
        let sensors = SensorService::new(scheduler.clone(), store.clone(), &bus);
        let cooling = CoolingService::new(sensors.clone(), store, &bus);
        Self {
            scheduler,
            bus,
            sensors,
            cooling,
        }
    }

    fn attach(&self, device_id: Uuid, features: DeviceFeatures) {
        self.bus.publish(DeviceEvent {
            kind: DeviceEventKind::Addition,
            device_id,
            features,
        });
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    async fn teardown(self) {
        self.cooling.shutdown().await;
        self.sensors.shutdown().await;
        self.scheduler.shutdown().await;
    }
}

#[tokio::test]
async fn curve_follows_a_sensor_on_another_device() {
    let stack = Stack::new();

    let fan_device = Uuid::new_v4();
    let fan_id = Uuid::new_v4();
    let fan = FanController::new(fan_id);
    stack.attach(
        fan_device,
        DeviceFeatures {
            sensors: None,
            cooling: Some(fan.clone()),
        },
    );
    stack.settle().await;

    // Curve configured before the temperature device exists: the fallback
    // power applies first.
    let temp_device = Uuid::new_v4();
    let temp_sensor = Uuid::new_v4();
    stack
        .cooling
        .set_software_curve(fan_device, fan_id, temp_device, temp_sensor, 30, identity_curve())
        .await
        .unwrap();
    stack.settle().await;
    assert_eq!(stack.cooling.cooling_mode(fan_device, fan_id).await, Some(
        CoolingMode::SoftwareCurve {
            sensor_device_id: temp_device,
            sensor_id: temp_sensor,
            fallback_power: 30,
            curve: identity_curve(),
        }
    ));
    assert_eq!(fan.manual_powers(), vec![30]);

    // The temperature device arrives reading 70 degrees; the identity curve
    // turns that into 70 percent power.
    let feature = GroupedTemperature::new(70.0);
    stack.attach(
        temp_device,
        DeviceFeatures {
            sensors: Some(Arc::new(TemperatureDevice {
                sensor_id: temp_sensor,
                feature: feature.clone(),
            })),
            cooling: None,
        },
    );
    stack.settle().await;

    let powers = fan.manual_powers();
    assert_eq!(powers.first(), Some(&30));
    assert_eq!(powers.last(), Some(&70));
    // Every drained batch ended in exactly one flush.
    let commands = fan.commands();
    assert_eq!(commands.last(), Some(&Command::Apply));

    // The curve keeps following the sensor.
    feature.set_value(90.0);
    stack.settle().await;
    assert_eq!(fan.manual_powers().last(), Some(&90));

    // Switching to manual stops the curve for good: later sensor changes
    // must not produce any further curve-driven commands.
    stack
        .cooling
        .set_manual_power(fan_device, fan_id, 40)
        .await
        .unwrap();
    stack.settle().await;
    let after_switch = fan.manual_powers();
    assert_eq!(after_switch.last(), Some(&40));

    feature.set_value(10.0);
    stack.settle().await;
    assert_eq!(fan.manual_powers(), after_switch);
    assert_eq!(
        stack.cooling.cooling_mode(fan_device, fan_id).await,
        Some(CoolingMode::Manual { power: 40 })
    );

    stack.teardown().await;
}

#[tokio::test]
async fn curve_falls_back_when_the_sensor_device_disconnects() {
    let stack = Stack::new();

    let fan_device = Uuid::new_v4();
    let fan_id = Uuid::new_v4();
    let fan = FanController::new(fan_id);
    stack.attach(
        fan_device,
        DeviceFeatures {
            sensors: None,
            cooling: Some(fan.clone()),
        },
    );

    let temp_device = Uuid::new_v4();
    let temp_sensor = Uuid::new_v4();
    let feature = GroupedTemperature::new(50.0);
    stack.attach(
        temp_device,
        DeviceFeatures {
            sensors: Some(Arc::new(TemperatureDevice {
                sensor_id: temp_sensor,
                feature,
            })),
            cooling: None,
        },
    );
    stack.settle().await;

    stack
        .cooling
        .set_software_curve(fan_device, fan_id, temp_device, temp_sensor, 25, identity_curve())
        .await
        .unwrap();
    stack.settle().await;
    // Fallback power is commanded first even though the sensor already
    // exists; curve-derived commands only follow it.
    let powers = fan.manual_powers();
    assert_eq!(powers.first(), Some(&25));
    assert_eq!(powers.last(), Some(&50));

    // The sensor device disappears; the cooler returns to its fallback and
    // stays there.
    stack.bus.publish(DeviceEvent {
        kind: DeviceEventKind::Removal,
        device_id: temp_device,
        features: DeviceFeatures::default(),
    });
    stack.settle().await;
    assert_eq!(fan.manual_powers().last(), Some(&25));

    stack.teardown().await;
}
