//! Bosch BMP280 temperature/pressure sensor over I2C.
//!
//! Configured the way the station has always run it: normal mode,
//! temperature oversampling x2, pressure x16, IIR filter x16, 500 ms standby.
//! Compensation uses the datasheet's floating-point formulas.

use tracing::{debug, info};

use crate::domain::Field;
use crate::error::SensorError;
use crate::hal::I2cBus;
use crate::sensors::SensorReader;

pub const DEFAULT_ADDRESS: u8 = 0x76;
pub const CHIP_ID: u8 = 0x58;

const REG_CALIB: u8 = 0x88;
const REG_CHIP_ID: u8 = 0xD0;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_CONFIG: u8 = 0xF5;
const REG_DATA: u8 = 0xF7;

// osrs_t = x2, osrs_p = x16, mode = normal
const CTRL_MEAS: u8 = (0b010 << 5) | (0b101 << 2) | 0b11;
// t_sb = 500 ms, filter = x16
const CONFIG: u8 = (0b100 << 5) | (0b100 << 2);

// value reported for a channel whose measurement was skipped
const ADC_SKIPPED: i32 = 0x80000;

/// Factory trim values read from 0x88..0x9F.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
}

impl Calibration {
    pub fn from_bytes(raw: &[u8; 24]) -> Self {
        let u = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);
        let s = |i: usize| i16::from_le_bytes([raw[i], raw[i + 1]]);
        Self {
            t1: u(0),
            t2: s(2),
            t3: s(4),
            p1: u(6),
            p2: s(8),
            p3: s(10),
            p4: s(12),
            p5: s(14),
            p6: s(16),
            p7: s(18),
            p8: s(20),
            p9: s(22),
        }
    }

    /// Returns `(celsius, t_fine)`.
    pub fn compensate_temperature(&self, adc_t: i32) -> (f64, f64) {
        let adc = f64::from(adc_t);
        let t1 = f64::from(self.t1);
        let var1 = (adc / 16384.0 - t1 / 1024.0) * f64::from(self.t2);
        let d = adc / 131072.0 - t1 / 8192.0;
        let var2 = d * d * f64::from(self.t3);
        let t_fine = var1 + var2;
        (t_fine / 5120.0, t_fine)
    }

    /// Pressure in pascal, or `None` when the trim values would divide by zero.
    pub fn compensate_pressure(&self, adc_p: i32, t_fine: f64) -> Option<f64> {
        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * f64::from(self.p6) / 32768.0;
        var2 += var1 * f64::from(self.p5) * 2.0;
        var2 = var2 / 4.0 + f64::from(self.p4) * 65536.0;
        var1 = (f64::from(self.p3) * var1 * var1 / 524_288.0 + f64::from(self.p2) * var1)
            / 524_288.0;
        var1 = (1.0 + var1 / 32768.0) * f64::from(self.p1);
        if var1 == 0.0 {
            return None;
        }
        let mut p = 1_048_576.0 - f64::from(adc_p);
        p = (p - var2 / 4096.0) * 6250.0 / var1;
        var1 = f64::from(self.p9) * p * p / 2_147_483_648.0;
        var2 = p * f64::from(self.p8) / 32768.0;
        Some(p + (var1 + var2 + f64::from(self.p7)) / 16.0)
    }
}

pub struct Bmp280<B> {
    bus: B,
    address: u8,
    calibration: Calibration,
}

impl<B: I2cBus> Bmp280<B> {
    /// Probe the chip id, read trim values and apply the sampling config.
    pub fn init(mut bus: B, address: u8) -> Result<Self, SensorError> {
        let mut id = [0u8; 1];
        bus.write_read(address, &[REG_CHIP_ID], &mut id)?;
        if id[0] != CHIP_ID {
            return Err(SensorError::NotFound(format!(
                "bmp280 at 0x{address:02X} (chip id 0x{:02X})",
                id[0]
            )));
        }

        let mut raw = [0u8; 24];
        bus.write_read(address, &[REG_CALIB], &mut raw)?;
        debug!("bmp280 calibration: {}", hex::encode(raw));
        let calibration = Calibration::from_bytes(&raw);

        bus.write(address, &[REG_CONFIG, CONFIG])?;
        bus.write(address, &[REG_CTRL_MEAS, CTRL_MEAS])?;
        info!("bmp280 found at 0x{address:02X}");

        Ok(Self {
            bus,
            address,
            calibration,
        })
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Burst-read the raw pressure and temperature ADC values.
    fn read_raw(&mut self) -> Result<(i32, i32), SensorError> {
        let mut data = [0u8; 6];
        self.bus.write_read(self.address, &[REG_DATA], &mut data)?;
        let adc = |msb: u8, lsb: u8, xlsb: u8| {
            (i32::from(msb) << 12) | (i32::from(lsb) << 4) | (i32::from(xlsb) >> 4)
        };
        let adc_p = adc(data[0], data[1], data[2]);
        let adc_t = adc(data[3], data[4], data[5]);
        Ok((adc_p, adc_t))
    }
}

impl<B: I2cBus> SensorReader for Bmp280<B> {
    fn name(&self) -> &str {
        "bmp280"
    }

    fn supports(&self, field: Field) -> bool {
        matches!(field, Field::Temperature | Field::Pressure)
    }

    fn read_temperature(&mut self) -> Result<f64, SensorError> {
        let (_, adc_t) = self.read_raw()?;
        if adc_t == ADC_SKIPPED {
            return Err(SensorError::Bus("temperature measurement skipped".into()));
        }
        Ok(self.calibration.compensate_temperature(adc_t).0)
    }

    /// Pressure in hPa.
    fn read_pressure(&mut self) -> Result<f64, SensorError> {
        let (adc_p, adc_t) = self.read_raw()?;
        if adc_p == ADC_SKIPPED || adc_t == ADC_SKIPPED {
            return Err(SensorError::Bus("pressure measurement skipped".into()));
        }
        let (_, t_fine) = self.calibration.compensate_temperature(adc_t);
        self.calibration
            .compensate_pressure(adc_p, t_fine)
            .map(|pa| pa / 100.0)
            .ok_or_else(|| SensorError::Bus("invalid pressure calibration".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // calibration and adc values from the worked example in the datasheet
    const EXAMPLE: Calibration = Calibration {
        t1: 27504,
        t2: 26435,
        t3: -1000,
        p1: 36477,
        p2: -10685,
        p3: 3024,
        p4: 2855,
        p5: 140,
        p6: -7,
        p7: 15500,
        p8: -14600,
        p9: 6000,
    };
    const ADC_T: i32 = 519_888;
    const ADC_P: i32 = 415_148;

    /// Register file fake: reads return bytes from `regs`, writes store them.
    struct FakeBus {
        regs: [u8; 256],
        fail: bool,
    }

    impl FakeBus {
        fn example() -> Self {
            let mut regs = [0u8; 256];
            regs[REG_CHIP_ID as usize] = CHIP_ID;
            let words: [u16; 12] = [
                EXAMPLE.t1,
                EXAMPLE.t2 as u16,
                EXAMPLE.t3 as u16,
                EXAMPLE.p1,
                EXAMPLE.p2 as u16,
                EXAMPLE.p3 as u16,
                EXAMPLE.p4 as u16,
                EXAMPLE.p5 as u16,
                EXAMPLE.p6 as u16,
                EXAMPLE.p7 as u16,
                EXAMPLE.p8 as u16,
                EXAMPLE.p9 as u16,
            ];
            for (i, word) in words.iter().enumerate() {
                let at = REG_CALIB as usize + i * 2;
                regs[at..at + 2].copy_from_slice(&word.to_le_bytes());
            }
            let p = (ADC_P << 4) as u32;
            let t = (ADC_T << 4) as u32;
            regs[0xF7..0xFA].copy_from_slice(&p.to_be_bytes()[1..]);
            regs[0xFA..0xFD].copy_from_slice(&t.to_be_bytes()[1..]);
            Self { regs, fail: false }
        }
    }

    impl I2cBus for FakeBus {
        fn write(&mut self, _addr: u8, bytes: &[u8]) -> Result<(), SensorError> {
            if let [reg, value] = bytes {
                self.regs[*reg as usize] = *value;
            }
            Ok(())
        }

        fn write_read(&mut self, _addr: u8, write: &[u8], read: &mut [u8]) -> Result<(), SensorError> {
            if self.fail {
                return Err(SensorError::Bus("nack".into()));
            }
            let start = write[0] as usize;
            read.copy_from_slice(&self.regs[start..start + read.len()]);
            Ok(())
        }
    }

    #[test]
    fn datasheet_temperature() {
        let (celsius, _) = EXAMPLE.compensate_temperature(ADC_T);
        assert!((celsius - 25.08).abs() < 0.01, "got {celsius}");
    }

    #[test]
    fn datasheet_pressure() {
        let (_, t_fine) = EXAMPLE.compensate_temperature(ADC_T);
        let pa = EXAMPLE.compensate_pressure(ADC_P, t_fine).unwrap();
        assert!((pa - 100_653.27).abs() < 1.0, "got {pa}");
    }

    #[test]
    fn zero_p1_is_rejected() {
        let cal = Calibration { p1: 0, ..EXAMPLE };
        assert!(cal.compensate_pressure(ADC_P, 128_422.0).is_none());
    }

    #[test]
    fn init_reads_calibration_and_configures() {
        let sensor = Bmp280::init(FakeBus::example(), DEFAULT_ADDRESS).unwrap();
        assert_eq!(sensor.calibration(), &EXAMPLE);
        assert_eq!(sensor.bus.regs[REG_CTRL_MEAS as usize], 0x57);
        assert_eq!(sensor.bus.regs[REG_CONFIG as usize], 0x90);
    }

    #[test]
    fn init_rejects_wrong_chip() {
        let mut bus = FakeBus::example();
        bus.regs[REG_CHIP_ID as usize] = 0x60;
        assert!(matches!(
            Bmp280::init(bus, DEFAULT_ADDRESS),
            Err(SensorError::NotFound(_))
        ));
    }

    #[test]
    fn sample_reports_hpa() {
        let mut sensor = Bmp280::init(FakeBus::example(), DEFAULT_ADDRESS).unwrap();
        let reading = sensor.sample();
        let hpa = reading.pressure_hpa.value().unwrap();
        assert!((hpa - 1006.53).abs() < 0.01, "got {hpa}");
        assert!(reading.temperature_c.is_valid());
        assert!(!reading.humidity_pct.is_valid());
    }

    #[test]
    fn bus_failure_invalidates_fields() {
        let mut sensor = Bmp280::init(FakeBus::example(), DEFAULT_ADDRESS).unwrap();
        sensor.bus.fail = true;
        let reading = sensor.sample();
        assert!(!reading.temperature_c.is_valid());
        assert!(!reading.pressure_hpa.is_valid());
    }
}
