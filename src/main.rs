use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use roboclaw_runtime::config::RobotConfig;

/// Drive RoboClaw motors from a JSON component config, over zenoh
#[derive(Debug, Parser)]
#[command(name = "roboclaw-runtime", version)]
struct Cli {
    /// Path to the JSON config with a "components" array
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Use simulated controllers instead of opening serial devices
    #[arg(long)]
    simulate: bool,

    /// Validate the config and exit
    #[arg(long)]
    check: bool,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging (RUST_LOG overrides the -v level)
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse().unwrap()))
        .init(); // installs the subscriber globally

    let config = match RobotConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(1);
        }
    };

    if cli.check {
        match config.motors() {
            Ok(motors) => {
                for motor in &motors {
                    println!(
                        "{}: {} @ {} baud, controller {}, channel {}, {} ticks/rotation",
                        motor.name,
                        motor.serial_path,
                        motor.baud_rate,
                        motor.address,
                        motor.channel,
                        motor.ticks_per_rotation
                    );
                }
                println!("{} roboclaw motor(s) OK", motors.len());
                return;
            }
            Err(e) => {
                eprintln!("Config error: {}", e);
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = roboclaw_runtime::runtime::run(config, cli.simulate).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from(["roboclaw-runtime", "-c", "robot.json", "--simulate", "-vv"]);
        assert_eq!(cli.config, PathBuf::from("robot.json"));
        assert!(cli.simulate);
        assert!(!cli.check);
        assert_eq!(cli.verbose, 2);

        assert!(Cli::try_parse_from(["roboclaw-runtime"]).is_err());
    }
}
