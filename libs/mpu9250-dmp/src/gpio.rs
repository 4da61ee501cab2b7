//! Sysfs GPIO interrupt pin.
//!
//! Minimal boundary wrapper: export the pin, set it as a falling-edge
//! input, and keep the value file descriptor open so the interrupt thread
//! can block on `poll(POLLPRI)`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::Result;

const SYSFS_GPIO_DIR: &str = "/sys/class/gpio";

/// A GPIO input line configured for falling-edge interrupts.
pub struct InterruptPin {
    pin: u32,
    value: File,
}

impl InterruptPin {
    /// Export `pin`, configure it as a falling-edge input, and open its
    /// value file. A pin that is already exported is reused as-is.
    pub fn new(pin: u32) -> Result<InterruptPin> {
        let value_path = format!("{}/gpio{}/value", SYSFS_GPIO_DIR, pin);
        if !Path::new(&value_path).exists() {
            let mut export = OpenOptions::new()
                .write(true)
                .open(format!("{}/export", SYSFS_GPIO_DIR))?;
            export.write_all(pin.to_string().as_bytes())?;
        } else {
            log::warn!("gpio {} already exported, reusing it", pin);
        }
        let mut direction = OpenOptions::new()
            .write(true)
            .open(format!("{}/gpio{}/direction", SYSFS_GPIO_DIR, pin))?;
        direction.write_all(b"in")?;
        let mut edge = OpenOptions::new()
            .write(true)
            .open(format!("{}/gpio{}/edge", SYSFS_GPIO_DIR, pin))?;
        edge.write_all(b"falling")?;
        let value = File::open(&value_path)?;
        Ok(InterruptPin { pin, value })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// Block until an edge fires or `timeout_ms` elapses.
    ///
    /// Returns `Ok(true)` on an edge (with the pending value drained so the
    /// next poll arms cleanly), `Ok(false)` on timeout. The finite timeout
    /// keeps shutdown from deadlocking on a stuck line.
    pub fn wait_for_edge(&mut self, timeout_ms: i32) -> Result<bool> {
        let mut fds = libc::pollfd {
            fd: self.value.as_raw_fd(),
            events: libc::POLLPRI | libc::POLLERR,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if ret == 0 || fds.revents & libc::POLLPRI == 0 {
            return Ok(false);
        }
        // consume the edge: rewind and drain the value file
        let mut buf = [0u8; 16];
        self.value.seek(SeekFrom::Start(0))?;
        let _ = self.value.read(&mut buf)?;
        Ok(true)
    }

    /// Return the pin to the kernel.
    pub fn unexport(self) -> Result<()> {
        let mut unexport = OpenOptions::new()
            .write(true)
            .open(format!("{}/unexport", SYSFS_GPIO_DIR))?;
        unexport.write_all(self.pin.to_string().as_bytes())?;
        Ok(())
    }
}
