// Keyboard teleop for one motor: W/S hold to run, G go for 1 rev, H go home,
// Z zero here, R/F speed, Space stop, Q quit
//
// Usage: cargo run --example cmd_publisher -- [motor name]
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use roboclaw_runtime::config::command_topic;
use roboclaw_runtime::messages::MotorCommand;
use std::time::{Duration, Instant};
use tracing::info;

const SPEEDS: [f64; 3] = [30.0, 90.0, 200.0]; // rpm
const INPUT_TIMEOUT_MS: u64 = 150; // Stop after this much time with no run key held

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let motor = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "motor1".to_string());

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let topic = command_topic(&motor);
    let publisher = session.declare_publisher(topic.clone()).await?;

    info!("Publishing to {}", topic);
    info!("Controls: W/S=run, G=go for 1 rev, H=go home, Z=zero, R/F=speed, Space=stop, Q=quit");
    info!("Speed: LOW");

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn send(
    publisher: &zenoh::pubsub::Publisher<'_>,
    cmd: &MotorCommand,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    publisher.put(serde_json::to_string(cmd)?).await?;
    Ok(())
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;

    // rpm currently requested by a held run key
    let mut running: Option<f64> = None;
    let mut last_run_input = Instant::now();

    loop {
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    // Hold to run; only publish when the request changes
                    KeyCode::Char('w') | KeyCode::Char('s') if pressed => {
                        let sign = if code == KeyCode::Char('w') { 1.0 } else { -1.0 };
                        let rpm = sign * SPEEDS[speed_idx];
                        if running != Some(rpm) {
                            send(publisher, &MotorCommand::SetRpm { rpm }).await?;
                            running = Some(rpm);
                        }
                        last_run_input = Instant::now();
                    }

                    KeyCode::Char('g') if pressed => {
                        let cmd = MotorCommand::GoFor {
                            rpm: SPEEDS[speed_idx],
                            revolutions: 1.0,
                        };
                        send(publisher, &cmd).await?;
                    }
                    KeyCode::Char('h') if pressed => {
                        let cmd = MotorCommand::GoTo {
                            rpm: SPEEDS[speed_idx],
                            position_revolutions: 0.0,
                        };
                        send(publisher, &cmd).await?;
                    }
                    KeyCode::Char('z') if pressed => {
                        send(publisher, &MotorCommand::ResetZeroPosition { offset: 0.0 }).await?;
                    }

                    // Speed control
                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(2);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    KeyCode::Char(' ') if pressed => {
                        send(publisher, &MotorCommand::Stop).await?;
                        running = None;
                    }

                    // Quit
                    KeyCode::Char('q') | KeyCode::Esc if pressed => {
                        send(publisher, &MotorCommand::Stop).await?;
                        break;
                    }

                    _ => {}
                }
            }
        }

        // Stop once the run key has been released for INPUT_TIMEOUT_MS
        if running.is_some() && last_run_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS)
        {
            send(publisher, &MotorCommand::Stop).await?;
            running = None;
        }
    }

    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {} ({} rpm)", label, SPEEDS[idx]);
}
