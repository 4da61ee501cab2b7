//! Stream DMP orientation data to the terminal.
//!
//! Brings the IMU up in DMP mode with the magnetometer enabled and prints
//! the filtered Tait-Bryan angles and compass heading on every data-ready
//! interrupt until Ctrl-C.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mpu9250_dmp::{Config, Mpu};

const RAD_TO_DEG: f32 = 57.29578;

fn main() {
    simplelog::TermLogger::init(
        simplelog::LevelFilter::Warn,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .expect("logger init");

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))
        .expect("SIGINT handler");

    let mut config = Config::default();
    config.enable_magnetometer = true;
    config.dmp_sample_rate = 25;
    config.show_warnings = std::env::args().any(|a| a == "-w");

    let mut imu = match Mpu::initialize_dmp(config) {
        Ok(imu) => imu,
        Err(e) => {
            eprintln!("failed to initialize IMU: {}", e);
            std::process::exit(1);
        }
    };

    println!("   DMP TaitBryan (deg)   |  Fused TaitBryan (deg)  | Heading (rad)");
    println!("  pitch |  roll  |  yaw  |  pitch |  roll  |  yaw  | raw | filtered");

    while !stop.load(Ordering::SeqCst) {
        match imu.block_until_new_data() {
            Ok(data) => {
                print!(
                    "\r{:6.1} | {:6.1} | {:5.1} | {:6.1} | {:6.1} | {:5.1} | {:4.2} | {:4.2}   ",
                    data.dmp_tait_bryan[0] * RAD_TO_DEG,
                    data.dmp_tait_bryan[1] * RAD_TO_DEG,
                    data.dmp_tait_bryan[2] * RAD_TO_DEG,
                    data.fused_tait_bryan[0] * RAD_TO_DEG,
                    data.fused_tait_bryan[1] * RAD_TO_DEG,
                    data.fused_tait_bryan[2] * RAD_TO_DEG,
                    data.compass_heading_raw,
                    data.compass_heading,
                );
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
            Err(_) => break,
        }
    }

    println!();
    if let Err(e) = imu.power_off() {
        eprintln!("failed to power off IMU: {}", e);
    }
}
