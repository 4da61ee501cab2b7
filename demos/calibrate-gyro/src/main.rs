//! Gyro calibration entry point.
//!
//! Samples the stationary gyro, gates on noise, and persists the bias for
//! every later initialization to load into the offset registers.

use mpu9250_dmp::{cal, Config};

fn main() {
    simplelog::TermLogger::init(
        simplelog::LevelFilter::Warn,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .expect("logger init");

    println!("This program will generate a new gyro calibration file.");
    println!("Set the device down and keep it perfectly still.");

    let config = Config::default();
    match cal::calibrate_gyro_routine(&config) {
        Ok(()) => {
            println!(
                "Gyro calibration written to {:?}",
                config.cal_dir.join(cal::GYRO_CAL_FILE)
            );
        }
        Err(e) => {
            eprintln!("gyro calibration failed: {}", e);
            std::process::exit(1);
        }
    }
}
