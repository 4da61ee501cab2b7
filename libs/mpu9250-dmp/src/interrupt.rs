//! The dedicated interrupt-handling thread.
//!
//! One thread per IMU instance runs `SCHED_FIFO` and blocks on the GPIO
//! data-ready line. Each wake is one tick: timestamp, claim the bus, pull
//! the freshest FIFO packet under the read and tap mutexes, fuse, run user
//! callbacks, and announce new data on the condition variables. Callbacks
//! execute on this thread while both mutexes are held, so they must not
//! call back into the driver.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::bus::Bus;
use crate::fusion::FusionFilter;
use crate::gpio::InterruptPin;
use crate::{chip, dmp, fifo, Shared};

/// GPIO poll timeout in ms; bounds shutdown latency when the interrupt
/// line goes quiet.
pub(crate) const IMU_POLL_TIMEOUT: i32 = 300;

/// Monotonic clock in nanoseconds.
pub(crate) fn nanos_now() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Move the calling thread onto the real-time FIFO scheduler.
fn set_rt_priority(priority: i32) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if ret != 0 {
        log::warn!(
            "failed to set SCHED_FIFO priority {} (error {}), running unscheduled",
            priority,
            ret
        );
    }
}

/// Thread body for the interrupt loop.
pub(crate) fn run<B: Bus>(shared: Arc<Shared<B>>, mut pin: InterruptPin) {
    set_rt_priority(shared.config.dmp_interrupt_priority);

    let config = &shared.config;
    let mut fusion = FusionFilter::new();
    // start the divider at its limit so the first tick reads the mag
    let mut mag_div_step = config.mag_sample_rate_div;
    let mut first_run = true;

    {
        let mut bus = shared.bus();
        let _ = dmp::reset_fifo(&mut *bus);
    }

    while !shared.shutdown.load(Ordering::SeqCst) {
        match pin.wait_for_edge(IMU_POLL_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                log::error!("interrupt pin poll failed: {}", e);
                break;
            }
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let interrupt_ns = nanos_now();
        shared.last_interrupt_ns.store(interrupt_ns, Ordering::SeqCst);

        let mut bus = shared.bus();
        if bus.is_locked() {
            log::warn!("i2c bus is claimed elsewhere during an IMU interrupt, reading anyway");
        }
        bus.lock();

        let mut cell = shared.data();
        let mut tap_cell = shared.tap();

        let read_ok = fifo::read_dmp_fifo(
            &mut *bus,
            config.i2c_addr,
            shared.packet_len,
            config.show_warnings,
            first_run,
            &mut cell.data,
        )
        .unwrap_or(false);
        shared.last_read_ok.store(read_ok, Ordering::SeqCst);
        if read_ok {
            if config.enable_magnetometer {
                fusion.step(config, &mut cell.data);
            }
            if cell.data.tap_detected {
                shared.last_tap_ns.store(interrupt_ns, Ordering::SeqCst);
            }
        }

        // optionally refresh the mag now so the callback sees it; costs
        // extra latency before the callback runs
        if config.enable_magnetometer && !config.read_mag_after_callback {
            if mag_div_step >= config.mag_sample_rate_div {
                read_mag_quietly(&mut *bus, &shared, &mut cell.data);
                mag_div_step = 1;
            } else {
                mag_div_step += 1;
            }
        }

        bus.unlock();
        drop(bus);

        // the first tick is suppressed: the DMP's startup output is junk
        if first_run {
            first_run = false;
        } else if read_ok {
            let mut callbacks = shared.callbacks();
            if let Some(cb) = callbacks.on_data.as_mut() {
                cb();
            }
            cell.seq += 1;
            shared.data_cond.notify_all();
            if cell.data.tap_detected {
                if let Some(cb) = callbacks.on_tap.as_mut() {
                    cb(cell.data.last_tap_direction);
                }
                tap_cell.seq += 1;
                tap_cell.direction = cell.data.last_tap_direction;
                shared.tap_cond.notify_all();
            }
        }

        drop(tap_cell);
        drop(cell);

        // mag after the callback: lowest callback latency, data lands on
        // the next tick
        if config.enable_magnetometer && config.read_mag_after_callback {
            if mag_div_step >= config.mag_sample_rate_div {
                let mut bus = shared.bus();
                bus.lock();
                let mut cell = shared.data();
                read_mag_quietly(&mut *bus, &shared, &mut cell.data);
                bus.unlock();
                mag_div_step = 1;
            } else {
                mag_div_step += 1;
            }
        }
    }

    // wake anyone still blocked before the thread goes away
    {
        let _cell = shared.data();
        shared.data_cond.notify_all();
    }
    {
        let _tap = shared.tap();
        shared.tap_cond.notify_all();
    }
    shared.thread_running.store(false, Ordering::SeqCst);
}

fn read_mag_quietly<B: Bus>(bus: &mut B, shared: &Shared<B>, data: &mut crate::data::MpuData) {
    match chip::read_mag(bus, &shared.mag_cal, data) {
        Ok(()) => {}
        Err(crate::error::Error::MagNotReady) => {
            if shared.config.show_warnings {
                log::warn!("no new magnetometer data ready, skipping read");
            }
        }
        Err(crate::error::Error::MagSaturated) => {
            if shared.config.show_warnings {
                log::warn!("magnetometer saturated, discarding data");
            }
        }
        Err(e) => log::error!("magnetometer read failed: {}", e),
    }
    // leave the bus pointed back at the MPU for the next tick
    let _ = bus.set_device_address(shared.config.i2c_addr);
}
