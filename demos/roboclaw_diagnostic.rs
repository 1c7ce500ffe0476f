// RoboClaw diagnostic: READ-ONLY check of a controller connection
//
// This tool does NOT write anything to the controller - no movement.
// Run it first when bringing up a new serial line.
//
// Usage: cargo run --example roboclaw_diagnostic -- [port] [baud] [address]
// Example: cargo run --example roboclaw_diagnostic -- /dev/ttyACM0 38400 128

use roboclaw_runtime::config::VALID_BAUD_RATES;
use roboclaw_runtime::motor::roboclaw::{BUFFER_IDLE, DUTY_SCALE};
use roboclaw_runtime::motor::{Channel, RoboclawBus, DEFAULT_ADDRESS, DEFAULT_BAUDRATE};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| "/dev/ttyACM0".to_string());
    let baud: u32 = match args.next() {
        Some(s) => s.parse()?,
        None => DEFAULT_BAUDRATE,
    };
    let address: u8 = match args.next() {
        Some(s) => s.parse()?,
        None => DEFAULT_ADDRESS,
    };

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║             RoboClaw Diagnostic (READ-ONLY)                  ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  This tool only READS from the controller - no movement      ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Serial port: {}", port);
    println!("Baud rate:   {}", baud);
    println!("Address:     {}", address);
    println!();

    if !VALID_BAUD_RATES.contains(&baud) {
        println!("⚠ {} is not a baud rate the controller supports", baud);
        println!("  Valid rates: {:?}", VALID_BAUD_RATES);
        return Ok(());
    }

    println!("Step 1: Opening serial port...");
    let mut bus = match RoboclawBus::open(&port, baud) {
        Ok(bus) => {
            println!("  ✓ Serial port opened successfully");
            bus
        }
        Err(e) => {
            println!("  ✗ Failed to open serial port: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the port path is correct");
            println!("  - Verify the USB cable is connected");
            println!("  - Check you are in the dialout group (Linux)");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Reading firmware version...");
    match bus.read_version(address) {
        Ok(version) => println!("  ✓ {}", version),
        Err(e) => {
            println!("  ✗ ERROR: {}", e);
            println!();
            println!("⚠ Controller did not answer. Check that:");
            println!("  - The controller is in packet serial mode");
            println!("  - Its baud rate is set to {} (Motion Studio)", baud);
            println!("  - Its address is set to {}", address);
            return Ok(());
        }
    }
    println!();

    println!("Step 3: Reading controller status...");
    match bus.read_main_battery(address) {
        Ok(volts) => println!("    Main battery:  {:.1} V", volts),
        Err(e) => println!("    Main battery:  ERROR - {}", e),
    }
    match bus.read_error(address) {
        Ok(0) => println!("    Error status:  none"),
        Ok(bits) => println!("    Error status:  0x{:08X}", bits),
        Err(e) => println!("    Error status:  ERROR - {}", e),
    }
    println!();

    println!("Step 4: Reading channels...");
    let pwms = bus.read_pwms(address);
    let buffers = bus.read_buffers(address);
    for channel in [Channel::M1, Channel::M2] {
        println!("  === Channel {} ===", channel);

        match bus.read_encoder(address, channel) {
            Ok(reading) => println!(
                "    Encoder:  {} (status 0x{:02X})",
                reading.count, reading.status
            ),
            Err(e) => println!("    Encoder:  ERROR - {}", e),
        }

        match bus.read_speed(address, channel) {
            Ok(qpps) => println!("    Speed:    {} counts/s", qpps),
            Err(e) => println!("    Speed:    ERROR - {}", e),
        }

        match &pwms {
            Ok((m1, m2)) => {
                let pwm = if channel == Channel::M1 { *m1 } else { *m2 };
                let pct = pwm as f64 * 100.0 / DUTY_SCALE as f64;
                println!("    PWM:      {} ({:.1}%)", pwm, pct);
            }
            Err(e) => println!("    PWM:      ERROR - {}", e),
        }

        match &buffers {
            Ok((m1, m2)) => {
                let depth = if channel == Channel::M1 { *m1 } else { *m2 };
                let status = if depth == BUFFER_IDLE { "idle" } else { "busy" };
                println!("    Buffer:   {} ({})", depth, status);
            }
            Err(e) => println!("    Buffer:   ERROR - {}", e),
        }
        println!();
    }

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                    Diagnostic Complete                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("If the controller answered and values look reasonable:");
    println!("  1. PWM should be 0 and buffers idle with nothing commanded");
    println!("  2. Encoder counts change when a wired motor shaft is turned by hand");
    println!("  3. Use serial_path={} serial_baud_rate={} in the config", port, baud);

    Ok(())
}
