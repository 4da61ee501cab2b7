//! DMP FIFO packet classification and parsing.
//!
//! Packets are 20 bytes (quaternion + gesture tail) or 32 bytes (quaternion
//! + accel + gyro + gesture tail). An I2C hiccup or a slow reader can leave
//! 2-5 packets queued, or tear the stream entirely; classification decides
//! whether to read, where the freshest whole packet starts, or whether the
//! FIFO has to be reset.

use crate::bus::Bus;
use crate::data::MpuData;
use crate::dmp;
use crate::error::{Error, Result};
use imu_math::quaternion;
use mpu9250_regs::mpu9250::regs;

/// Packet length with the quaternion and gesture tail only.
pub const FIFO_LEN_QUAT_TAP: usize = 20;
/// Packet length with raw accel and gyro included.
pub const FIFO_LEN_QUAT_ACCEL_GYRO_TAP: usize = 32;
/// Largest burst the reader will pull in one tick.
pub const MAX_FIFO_BUFFER: usize = FIFO_LEN_QUAT_ACCEL_GYRO_TAP * 5;

/// The DMP emits unit quaternions in Q30; dropped or inserted bytes shear
/// the fixed-point fields, so the squared magnitude in Q14 terms must stay
/// within a tight window around 2^28.
const QUAT_MAG_SQ_NORMALIZED: i64 = 1 << 28;
const QUAT_ERROR_THRESH: i64 = 1 << 16;
const QUAT_MAG_SQ_MIN: i64 = QUAT_MAG_SQ_NORMALIZED - QUAT_ERROR_THRESH;
const QUAT_MAG_SQ_MAX: i64 = QUAT_MAG_SQ_NORMALIZED + QUAT_ERROR_THRESH;

/// Gesture tail flag: a tap fired during the sample window.
const INT_SRC_TAP: u8 = 0x01;

/// What to do with the FIFO given its byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoClass {
    /// Nothing buffered; drop this tick.
    Empty,
    /// One to five whole packets; parse the packet at `offset`.
    Packets { count: usize, offset: usize },
    /// Byte count is not a small multiple of the packet length; the stream
    /// is torn and the FIFO must be reset.
    Desync,
}

/// Classify the FIFO count register value.
///
/// One packet is the normal case. Two or three mean we missed interrupts
/// and the newest packet is parsed; at four or five the backlog is deep
/// enough that the third packet is taken so the read stays inside one
/// bounded burst. Anything else forces a reset.
pub fn classify_fifo_count(fifo_count: usize, packet_len: usize) -> FifoClass {
    if fifo_count == 0 {
        return FifoClass::Empty;
    }
    if fifo_count % packet_len != 0 {
        return FifoClass::Desync;
    }
    let count = fifo_count / packet_len;
    let offset = match count {
        1 => 0,
        2 => packet_len,
        3 => 2 * packet_len,
        4 | 5 => 2 * packet_len,
        _ => return FifoClass::Desync,
    };
    FifoClass::Packets { count, offset }
}

/// A tap gesture decoded from the packet tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tap {
    /// 1-6 for +X -X +Y -Y +Z -Z.
    pub direction: u8,
    /// Consecutive tap count, 1-8.
    pub count: u8,
}

/// One parsed DMP packet.
#[derive(Debug, Clone)]
pub struct FifoPacket {
    /// Normalized quaternion, `[w, x, y, z]`.
    pub quat: [f32; 4],
    /// Tait-Bryan `[pitch_x, roll_y, yaw_z]` derived from `quat`.
    pub tait_bryan: [f32; 3],
    pub raw_accel: Option<[i16; 3]>,
    pub raw_gyro: Option<[i16; 3]>,
    pub tap: Option<Tap>,
}

fn be_i32(raw: &[u8]) -> i32 {
    i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
}

/// Parse the packet starting at `offset` in `raw`.
///
/// Validates the Q14 magnitude window before anything else; an
/// out-of-bounds quaternion means the byte stream is misaligned and the
/// caller must reset the FIFO.
pub fn parse_packet(raw: &[u8], offset: usize, packet_len: usize) -> Result<FifoPacket> {
    if raw.len() < offset + packet_len {
        return Err(Error::FifoDesync("short packet buffer"));
    }
    let mut i = offset;
    let quat_raw = [
        be_i32(&raw[i..]),
        be_i32(&raw[i + 4..]),
        be_i32(&raw[i + 8..]),
        be_i32(&raw[i + 12..]),
    ];
    i += 16;

    // scale down to Q14 before squaring to stay inside 64-bit math
    let mag_sq: i64 = quat_raw
        .iter()
        .map(|&q| {
            let q14 = (q >> 16) as i64;
            q14 * q14
        })
        .sum();
    if !(QUAT_MAG_SQ_MIN..=QUAT_MAG_SQ_MAX).contains(&mag_sq) {
        return Err(Error::FifoDesync("quaternion magnitude out of bounds"));
    }

    // raw Q30 components are huge; normalize in double precision
    let mut sum = 0.0f64;
    for &q in &quat_raw {
        sum += q as f64 * q as f64;
    }
    let len = sum.sqrt();
    let mut quat = [0.0f32; 4];
    for (dst, &q) in quat.iter_mut().zip(&quat_raw) {
        *dst = (q as f64 / len) as f32;
    }
    let tait_bryan = quaternion::quaternion_to_tb(&quat);

    let (raw_accel, raw_gyro) = if packet_len == FIFO_LEN_QUAT_ACCEL_GYRO_TAP {
        let mut accel = [0i16; 3];
        let mut gyro = [0i16; 3];
        for k in 0..3 {
            accel[k] = i16::from_be_bytes([raw[i + 2 * k], raw[i + 2 * k + 1]]);
        }
        i += 6;
        for k in 0..3 {
            gyro[k] = i16::from_be_bytes([raw[i + 2 * k], raw[i + 2 * k + 1]]);
        }
        i += 6;
        (Some(accel), Some(gyro))
    } else {
        (None, None)
    };

    // 4-byte gesture tail
    let tap = if raw[i + 1] & INT_SRC_TAP != 0 {
        let tap_byte = raw[i + 3] & 0x3f;
        Some(Tap {
            direction: tap_byte >> 3,
            count: (tap_byte % 8) + 1,
        })
    } else {
        None
    };

    Ok(FifoPacket {
        quat,
        tait_bryan,
        raw_accel,
        raw_gyro,
        tap,
    })
}

/// Read and parse the freshest DMP packet into `data`.
///
/// Returns `Ok(true)` when new DMP data landed, `Ok(false)` for a dropped
/// tick (empty FIFO, desync recovered by reset, torn read). Transport
/// errors on the count read surface after the FIFO read retries once.
pub fn read_dmp_fifo<B: Bus>(
    bus: &mut B,
    addr: u16,
    packet_len: usize,
    show_warnings: bool,
    first_run: bool,
    data: &mut MpuData,
) -> Result<bool> {
    debug_assert!(
        packet_len == FIFO_LEN_QUAT_TAP || packet_len == FIFO_LEN_QUAT_ACCEL_GYRO_TAP
    );
    bus.set_device_address(addr)?;

    let fifo_count = match bus.read_word(regs::FIFO_COUNTH) {
        Ok(c) => c as usize,
        Err(e) => {
            if show_warnings {
                log::warn!("fifo count read failed: {}", e);
            }
            return Ok(false);
        }
    };

    let offset = match classify_fifo_count(fifo_count, packet_len) {
        FifoClass::Empty => {
            if show_warnings && !first_run {
                log::warn!("empty fifo");
            }
            return Ok(false);
        }
        FifoClass::Packets { count, offset } => {
            if count > 1 && show_warnings && !first_run {
                log::warn!("imu fifo contains {} packets", count);
            }
            offset
        }
        FifoClass::Desync => {
            if show_warnings && !first_run {
                log::warn!("{} bytes in FIFO, expected {}", fifo_count, packet_len);
            }
            dmp::reset_fifo(bus)?;
            return Ok(false);
        }
    };

    let mut raw = [0u8; MAX_FIFO_BUFFER];
    let buf = &mut raw[..fifo_count];
    if bus.read_bytes(regs::FIFO_R_W, buf).is_err() {
        // one retry; i2c bursts this long occasionally drop an ack
        if let Err(e) = bus.read_bytes(regs::FIFO_R_W, buf) {
            if show_warnings {
                log::warn!("failed to read fifo buffer register: {}", e);
            }
            return Ok(false);
        }
    }

    let packet = match parse_packet(buf, offset, packet_len) {
        Ok(p) => p,
        Err(Error::FifoDesync(reason)) => {
            if show_warnings {
                log::warn!("fifo desync ({}), resetting", reason);
            }
            dmp::reset_fifo(bus)?;
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    data.dmp_quat = packet.quat;
    data.dmp_tait_bryan = packet.tait_bryan;
    if let (Some(accel), Some(gyro)) = (packet.raw_accel, packet.raw_gyro) {
        data.raw_accel = accel;
        data.raw_gyro = gyro;
        for k in 0..3 {
            data.accel[k] = accel[k] as f32 * data.accel_to_ms2;
            data.gyro[k] = gyro[k] as f32 * data.gyro_to_degs;
        }
    }
    match packet.tap {
        Some(tap) => {
            data.tap_detected = true;
            data.last_tap_direction = tap.direction;
        }
        None => data.tap_detected = false,
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use mpu9250_regs::mpu9250::I2C_ADDRESS;

    /// Encode a unit quaternion as a Q30 big-endian packet body.
    fn encode_packet(quat: [f64; 4], tap_byte: Option<u8>, packet_len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(packet_len);
        for q in quat.iter() {
            let fixed = (q * (1i64 << 30) as f64) as i64 as i32;
            out.extend_from_slice(&fixed.to_be_bytes());
        }
        while out.len() < packet_len - 4 {
            out.push(0);
        }
        // 4-byte gesture tail
        match tap_byte {
            Some(t) => out.extend_from_slice(&[0, INT_SRC_TAP, 0, t]),
            None => out.extend_from_slice(&[0, 0, 0, 0]),
        }
        out
    }

    #[test]
    fn classification_table() {
        let pl = FIFO_LEN_QUAT_TAP;
        assert_eq!(classify_fifo_count(0, pl), FifoClass::Empty);
        assert_eq!(
            classify_fifo_count(pl, pl),
            FifoClass::Packets { count: 1, offset: 0 }
        );
        assert_eq!(
            classify_fifo_count(2 * pl, pl),
            FifoClass::Packets { count: 2, offset: pl }
        );
        assert_eq!(
            classify_fifo_count(3 * pl, pl),
            FifoClass::Packets { count: 3, offset: 2 * pl }
        );
        assert_eq!(
            classify_fifo_count(4 * pl, pl),
            FifoClass::Packets { count: 4, offset: 2 * pl }
        );
        assert_eq!(
            classify_fifo_count(5 * pl, pl),
            FifoClass::Packets { count: 5, offset: 2 * pl }
        );
        assert_eq!(classify_fifo_count(6 * pl, pl), FifoClass::Desync);
        assert_eq!(classify_fifo_count(pl + 1, pl), FifoClass::Desync);
        assert_eq!(classify_fifo_count(7, pl), FifoClass::Desync);
    }

    #[test]
    fn identity_quaternion_packet() {
        let buf = encode_packet([1.0, 0.0, 0.0, 0.0], None, FIFO_LEN_QUAT_TAP);
        let p = parse_packet(&buf, 0, FIFO_LEN_QUAT_TAP).unwrap();
        assert!((p.quat[0] - 1.0).abs() < 1e-6);
        for k in 1..4 {
            assert!(p.quat[k].abs() < 1e-6);
        }
        for k in 0..3 {
            assert!(p.tait_bryan[k].abs() < 1e-6);
        }
        assert!(p.tap.is_none());
        assert!(p.raw_accel.is_none());
    }

    #[test]
    fn out_of_bounds_quaternion_is_desync() {
        // half-magnitude quaternion: Q14 magnitude^2 lands near 2^26
        let buf = encode_packet([0.5, 0.0, 0.0, 0.0], None, FIFO_LEN_QUAT_TAP);
        assert!(matches!(
            parse_packet(&buf, 0, FIFO_LEN_QUAT_TAP),
            Err(Error::FifoDesync(_))
        ));
    }

    #[test]
    fn accel_gyro_packet_carries_raw_triples() {
        let mut buf = encode_packet(
            [0.70710678, 0.0, 0.0, 0.70710678],
            None,
            FIFO_LEN_QUAT_ACCEL_GYRO_TAP,
        );
        // accel at bytes 16..22, gyro at 22..28
        buf[16..18].copy_from_slice(&1000i16.to_be_bytes());
        buf[18..20].copy_from_slice(&(-2000i16).to_be_bytes());
        buf[20..22].copy_from_slice(&16384i16.to_be_bytes());
        buf[22..24].copy_from_slice(&(-10i16).to_be_bytes());
        buf[24..26].copy_from_slice(&20i16.to_be_bytes());
        buf[26..28].copy_from_slice(&(-30i16).to_be_bytes());
        let p = parse_packet(&buf, 0, FIFO_LEN_QUAT_ACCEL_GYRO_TAP).unwrap();
        assert_eq!(p.raw_accel.unwrap(), [1000, -2000, 16384]);
        assert_eq!(p.raw_gyro.unwrap(), [-10, 20, -30]);
        // 90 degrees of yaw
        assert!((p.tait_bryan[2] - std::f32::consts::FRAC_PI_2).abs() < 1e-4);
    }

    #[test]
    fn tap_decode() {
        // direction 3, count 2: tap byte = (3 << 3) | 1
        let buf = encode_packet(
            [1.0, 0.0, 0.0, 0.0],
            Some((3 << 3) | 1),
            FIFO_LEN_QUAT_TAP,
        );
        let p = parse_packet(&buf, 0, FIFO_LEN_QUAT_TAP).unwrap();
        let tap = p.tap.unwrap();
        assert_eq!(tap.direction, 3);
        assert_eq!(tap.count, 2);
    }

    #[test]
    fn three_packet_backlog_publishes_the_third() {
        let pl = FIFO_LEN_QUAT_TAP;
        let mut stream = Vec::new();
        stream.extend(encode_packet([1.0, 0.0, 0.0, 0.0], None, pl));
        stream.extend(encode_packet([0.0, 1.0, 0.0, 0.0], None, pl));
        let yaw90 = [0.70710678, 0.0, 0.0, 0.70710678];
        stream.extend(encode_packet(yaw90, None, pl));

        let mut bus = MockBus::new();
        bus.set_reg(I2C_ADDRESS, regs::FIFO_COUNTH, 0);
        bus.set_reg(I2C_ADDRESS, regs::FIFO_COUNTL, (3 * pl) as u8);
        bus.fifo_stream.push_back(stream);

        let mut data = MpuData::default();
        let got = read_dmp_fifo(&mut bus, I2C_ADDRESS, pl, false, false, &mut data).unwrap();
        assert!(got);
        assert!((data.dmp_quat[0] - 0.70710678).abs() < 1e-5);
        assert!((data.dmp_quat[3] - 0.70710678).abs() < 1e-5);
        assert!((data.dmp_tait_bryan[2] - std::f32::consts::FRAC_PI_2).abs() < 1e-4);
    }

    #[test]
    fn five_packet_backlog_still_publishes_one() {
        let pl = FIFO_LEN_QUAT_TAP;
        let quats: [[f64; 4]; 5] = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
            [0.70710678, 0.70710678, 0.0, 0.0],
        ];
        let mut stream = Vec::new();
        for q in &quats {
            stream.extend(encode_packet(*q, None, pl));
        }
        let mut bus = MockBus::new();
        bus.set_reg(I2C_ADDRESS, regs::FIFO_COUNTL, (5 * pl) as u8);
        bus.fifo_stream.push_back(stream);

        let mut data = MpuData::default();
        let got = read_dmp_fifo(&mut bus, I2C_ADDRESS, pl, false, false, &mut data).unwrap();
        assert!(got);
        // offset 2 * packet_len: the third quaternion in the backlog
        assert!((data.dmp_quat[2] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn weird_count_resets_the_fifo() {
        let mut bus = MockBus::new();
        bus.set_reg(I2C_ADDRESS, regs::FIFO_COUNTH, 0);
        bus.set_reg(I2C_ADDRESS, regs::FIFO_COUNTL, 7);
        let mut data = MpuData::default();
        let got = read_dmp_fifo(
            &mut bus,
            I2C_ADDRESS,
            FIFO_LEN_QUAT_TAP,
            false,
            false,
            &mut data,
        )
        .unwrap();
        assert!(!got);
        // the reset sequence pulsed FIFO_RST | DMP_RST
        assert!(bus
            .writes_to(I2C_ADDRESS, regs::USER_CTRL)
            .contains(&vec![0x0c]));
    }

    #[test]
    fn empty_fifo_drops_the_tick() {
        let mut bus = MockBus::new();
        let mut data = MpuData::default();
        let got = read_dmp_fifo(
            &mut bus,
            I2C_ADDRESS,
            FIFO_LEN_QUAT_TAP,
            false,
            false,
            &mut data,
        )
        .unwrap();
        assert!(!got);
        assert!(bus.writes_to(I2C_ADDRESS, regs::USER_CTRL).is_empty());
    }

    #[test]
    fn corrupt_quaternion_in_stream_resets() {
        let pl = FIFO_LEN_QUAT_TAP;
        let mut bus = MockBus::new();
        bus.set_reg(I2C_ADDRESS, regs::FIFO_COUNTL, pl as u8);
        bus.fifo_stream
            .push_back(encode_packet([0.3, 0.0, 0.0, 0.0], None, pl));
        let mut data = MpuData::default();
        let got = read_dmp_fifo(&mut bus, I2C_ADDRESS, pl, false, false, &mut data).unwrap();
        assert!(!got);
        assert!(bus
            .writes_to(I2C_ADDRESS, regs::USER_CTRL)
            .contains(&vec![0x0c]));
    }
}
