// Motor runtime: routes zenoh commands to motors and publishes their state
//
// Commands arrive on roboclaw/<name>/cmd and go into that motor's queue. One
// worker per motor runs them in arrival order on a blocking thread (serial I/O,
// and moves that wait for completion). A new command for a motor supersedes
// whatever it was doing as soon as it is queued. State is published at LOOP_HZ.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{
    command_topic, state_topic, MotorConfig, RobotConfig, LOOP_HZ, TOPIC_CMD_ALL, TOPIC_PREFIX,
};
use crate::messages::{MotorCommand, MotorState};
use crate::motor::{BusRegistry, MotorError, RoboclawMotor};

pub struct Runtime {
    motors: HashMap<String, Arc<RoboclawMotor>>,
}

impl Runtime {
    /// Build one motor per config entry, sharing buses between motors on the same line
    pub fn from_configs(
        configs: &[MotorConfig],
        registry: &mut BusRegistry,
    ) -> Result<Self, MotorError> {
        let mut motors = HashMap::new();
        for config in configs {
            let bus = registry.acquire(&config.serial_path, config.baud_rate)?;
            motors.insert(
                config.name.clone(),
                Arc::new(RoboclawMotor::new(config, bus)),
            );
        }
        Ok(Self { motors })
    }

    pub fn motor(&self, name: &str) -> Option<&Arc<RoboclawMotor>> {
        self.motors.get(name)
    }

    pub fn motor_names(&self) -> impl Iterator<Item = &str> {
        self.motors.keys().map(String::as_str)
    }

    /// Resolve an incoming sample to its motor and parsed command
    fn route(&self, key: &str, payload: &[u8]) -> Option<(Arc<RoboclawMotor>, MotorCommand)> {
        let Some(name) = motor_name_from_key(key) else {
            warn!("Ignoring sample on unexpected key {}", key);
            return None;
        };
        let Some(motor) = self.motors.get(name) else {
            warn!("Command for unknown motor {}", name);
            return None;
        };
        match serde_json::from_slice::<MotorCommand>(payload) {
            Ok(cmd) => {
                info!("Received command for {}: {:?}", name, &cmd);
                Some((Arc::clone(motor), cmd))
            }
            Err(e) => {
                warn!("Failed to parse command for {}: {}", name, e);
                None
            }
        }
    }

    /// Read every motor's state (blocking serial I/O)
    fn snapshot(&self) -> Vec<MotorState> {
        self.motors.values().map(|m| m.state()).collect()
    }

    /// Start one command worker per motor
    fn spawn_queues(&self) -> (HashMap<String, CommandQueue>, Vec<JoinHandle<()>>) {
        let mut queues = HashMap::new();
        let mut workers = Vec::new();
        for (name, motor) in &self.motors {
            let (queue, worker) = CommandQueue::spawn(Arc::clone(motor));
            queues.insert(name.clone(), queue);
            workers.push(worker);
        }
        (queues, workers)
    }
}

/// Ordered command queue for one motor, drained by a single worker task
pub struct CommandQueue {
    motor: Arc<RoboclawMotor>,
    tx: mpsc::UnboundedSender<(u64, MotorCommand)>,
}

impl CommandQueue {
    /// Start the worker. It exits once the queue is dropped and drained.
    pub fn spawn(motor: Arc<RoboclawMotor>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(u64, MotorCommand)>();
        let worker_motor = Arc::clone(&motor);
        let worker = tokio::spawn(async move {
            while let Some((op, cmd)) = rx.recv().await {
                let motor = Arc::clone(&worker_motor);
                let kind = cmd.op();
                let result =
                    tokio::task::spawn_blocking(move || motor.run_reserved(op, cmd)).await;
                match result {
                    Ok(Ok(())) => debug!("{}: {} done", worker_motor.name(), kind),
                    Ok(Err(e)) => warn!("{}: {} failed: {}", worker_motor.name(), kind, e),
                    Err(e) => warn!("{}: {} task failed: {}", worker_motor.name(), kind, e),
                }
            }
        });
        (Self { motor, tx }, worker)
    }

    /// Queue a command behind the ones already sent. Cancels any move the
    /// motor is running right away.
    pub fn push(&self, cmd: MotorCommand) {
        let op = self.motor.reserve();
        if self.tx.send((op, cmd)).is_err() {
            warn!("{}: command worker is gone, dropping command", self.motor.name());
        }
    }
}

/// Motor name from a command key: roboclaw/<name>/cmd
pub fn motor_name_from_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(TOPIC_PREFIX)?.strip_prefix('/')?;
    let name = rest.strip_suffix("/cmd")?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some(name)
}

/// Validate the config, open the serial lines and serve until Ctrl-C
pub async fn run(
    config: RobotConfig,
    simulate: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let configs = config.motors()?;
    if configs.is_empty() {
        warn!("No roboclaw motors configured");
    }

    let mut registry = if simulate {
        BusRegistry::simulated()
    } else {
        BusRegistry::new()
    };
    let runtime = Arc::new(Runtime::from_configs(&configs, &mut registry)?);
    info!(
        "{} motor(s) on {} serial line(s){}",
        configs.len(),
        registry.len(),
        if simulate { " (simulated)" } else { "" }
    );

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_ALL).await?;
    let (queues, workers) = runtime.spawn_queues();
    let mut publishers = HashMap::new();
    for name in runtime.motor_names() {
        let publisher = session.declare_publisher(state_topic(name)).await?;
        info!("{}: commands on {}, state on {}", name, command_topic(name), state_topic(name));
        publishers.insert(name.to_string(), publisher);
    }

    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Runtime started: {}Hz state loop", LOOP_HZ);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }

        // 1. Drain all pending commands (non-blocking)
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            if let Some((motor, cmd)) = runtime.route(sample.key_expr().as_str(), &payload) {
                if let Some(queue) = queues.get(motor.name()) {
                    queue.push(cmd);
                }
            }
        }

        // 2. Read state off the serial lines
        let rt = Arc::clone(&runtime);
        let states = tokio::task::spawn_blocking(move || rt.snapshot()).await?;

        // 3. Publish state
        for state in states {
            if let Some(publisher) = publishers.get(&state.name) {
                let state_json = serde_json::to_string(&state)?;
                publisher.put(state_json).await?;
            }
        }
    }

    info!("Shutting down, stopping motors");
    for queue in queues.values() {
        queue.push(MotorCommand::Stop);
    }
    drop(queues);
    for worker in workers {
        worker.await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> Vec<MotorConfig> {
        let config = RobotConfig::from_json(
            r#"{"components":[
                {"name":"left","model":"roboclaw","type":"motor",
                 "attributes":{"serial_path":"/dev/ttyACM0","motor_channel":1,"ticks_per_rotation":100}},
                {"name":"right","model":"roboclaw","type":"motor",
                 "attributes":{"serial_path":"/dev/ttyACM0","motor_channel":2}}
            ]}"#,
        )
        .unwrap();
        config.motors().unwrap()
    }

    #[test]
    fn test_motor_name_from_key() {
        assert_eq!(motor_name_from_key("roboclaw/left/cmd"), Some("left"));
        assert_eq!(motor_name_from_key("roboclaw//cmd"), None);
        assert_eq!(motor_name_from_key("roboclaw/a/b/cmd"), None);
        assert_eq!(motor_name_from_key("roboclaw/left/state"), None);
        assert_eq!(motor_name_from_key("other/left/cmd"), None);
    }

    #[test]
    fn test_motors_share_line() {
        let mut registry = BusRegistry::simulated();
        let runtime = Runtime::from_configs(&configs(), &mut registry).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(runtime.motor_names().count(), 2);
        assert!(runtime.motor("left").is_some());
    }

    #[test]
    fn test_route() {
        let mut registry = BusRegistry::simulated();
        let runtime = Runtime::from_configs(&configs(), &mut registry).unwrap();

        let (motor, cmd) = runtime
            .route("roboclaw/right/cmd", br#"{"op":"set_power","power_pct":0.4}"#)
            .unwrap();
        assert_eq!(motor.name(), "right");
        assert_eq!(cmd, MotorCommand::SetPower { power_pct: 0.4 });

        assert!(runtime.route("roboclaw/nobody/cmd", br#"{"op":"stop"}"#).is_none());
        assert!(runtime.route("roboclaw/left/cmd", b"not json").is_none());
    }

    fn line_pwms(registry: &mut BusRegistry) -> (i16, i16) {
        registry
            .acquire("/dev/ttyACM0", 38_400)
            .unwrap()
            .lock()
            .unwrap()
            .read_pwms(128)
            .unwrap()
    }

    #[test]
    fn test_reserved_commands_and_snapshot() {
        let mut registry = BusRegistry::simulated();
        let runtime = Runtime::from_configs(&configs(), &mut registry).unwrap();
        let left = runtime.motor("left").unwrap();
        let right = runtime.motor("right").unwrap();

        right
            .run_reserved(right.reserve(), MotorCommand::SetPower { power_pct: -0.5 })
            .unwrap();
        left.run_reserved(left.reserve(), MotorCommand::ResetZeroPosition { offset: -1.0 })
            .unwrap();
        let go_to = MotorCommand::GoTo {
            rpm: 10.0,
            position_revolutions: 1.0,
        };
        assert!(matches!(
            right.run_reserved(right.reserve(), go_to),
            Err(MotorError::EncoderRequired { .. })
        ));

        let states = runtime.snapshot();
        let right_state = states.iter().find(|s| s.name == "right").unwrap();
        assert!(right_state.is_powered);
        assert!(right_state.power_pct < 0.0);
        let left_state = states.iter().find(|s| s.name == "left").unwrap();
        assert!(!left_state.is_powered);
        assert!((left_state.position - 1.0).abs() < 1e-9);
        assert!(left.properties().position_reporting);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_queue_keeps_arrival_order() {
        let mut registry = BusRegistry::simulated();
        let runtime = Runtime::from_configs(&configs(), &mut registry).unwrap();
        let right = Arc::clone(runtime.motor("right").unwrap());

        for _ in 0..50 {
            let (queue, worker) = CommandQueue::spawn(Arc::clone(&right));
            for i in 1..=8 {
                queue.push(MotorCommand::SetPower {
                    power_pct: i as f64 / 10.0,
                });
            }
            queue.push(MotorCommand::Stop);
            drop(queue);
            worker.await.unwrap();
            assert_eq!(line_pwms(&mut registry), (0, 0));
        }

        let (queue, worker) = CommandQueue::spawn(Arc::clone(&right));
        queue.push(MotorCommand::Stop);
        queue.push(MotorCommand::SetPower { power_pct: 0.4 });
        drop(queue);
        worker.await.unwrap();
        assert!(right.is_powered().unwrap().0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queued_command_cancels_running_move() {
        let mut registry = BusRegistry::simulated();
        let runtime = Runtime::from_configs(&configs(), &mut registry).unwrap();
        let right = Arc::clone(runtime.motor("right").unwrap());
        let (queue, worker) = CommandQueue::spawn(Arc::clone(&right));

        let start = std::time::Instant::now();
        // 10 revolutions at 250 rpm would take 2.4 s
        queue.push(MotorCommand::GoFor {
            rpm: 250.0,
            revolutions: 10.0,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(right.is_powered().unwrap().0);

        queue.push(MotorCommand::Stop);
        drop(queue);
        worker.await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!right.is_powered().unwrap().0);
    }

    #[tokio::test]
    async fn test_queued_move_overtaken_before_start_is_skipped() {
        let mut registry = BusRegistry::simulated();
        let runtime = Runtime::from_configs(&configs(), &mut registry).unwrap();
        let right = Arc::clone(runtime.motor("right").unwrap());
        let (queue, worker) = CommandQueue::spawn(Arc::clone(&right));

        let start = std::time::Instant::now();
        queue.push(MotorCommand::GoFor {
            rpm: 250.0,
            revolutions: 10.0,
        });
        queue.push(MotorCommand::SetPower { power_pct: 0.3 });
        drop(queue);
        worker.await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        let (on, power) = right.is_powered().unwrap();
        assert!(on);
        assert!((power - 0.3).abs() < 1e-3);
    }

    #[test]
    fn test_conflicting_baud_rate_on_open_line() {
        let mut registry = BusRegistry::simulated();
        registry.acquire("/dev/ttyACM0", 115_200).unwrap();
        let err = Runtime::from_configs(&configs(), &mut registry).err().unwrap();
        assert!(matches!(err, MotorError::BaudRateMismatch { .. }));
    }
}
