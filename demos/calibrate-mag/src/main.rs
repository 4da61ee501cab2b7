//! Magnetometer calibration entry point.
//!
//! Collects a field sweep while the user rotates the device, fits an
//! ellipsoid, and persists offsets and scales that map the local field
//! onto a sphere.

use mpu9250_dmp::{cal, Config};

fn main() {
    simplelog::TermLogger::init(
        simplelog::LevelFilter::Warn,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .expect("logger init");

    println!("This program will generate a new magnetometer calibration file.");
    println!("Rotate the device slowly through every orientation while it samples.");

    let config = Config::default();
    match cal::calibrate_mag_routine(&config) {
        Ok(()) => {
            println!(
                "Magnetometer calibration written to {:?}",
                config.cal_dir.join(cal::MAG_CAL_FILE)
            );
        }
        Err(e) => {
            eprintln!("magnetometer calibration failed: {}", e);
            std::process::exit(1);
        }
    }
}
