use telematics_core::record::{
    PID_ACC, PID_GPS_LATITUDE, PID_GPS_LONGITUDE, PID_RPM, PID_SPEED, Reading, Record,
};

/// Accelerometer samples averaged into one record per loop.
const ACC_SAMPLES_PER_LOOP: i32 = 8;

/// One GPS fix every this many loops.
const GPS_EVERY: u32 = 4;

/// Micro-degrees of latitude per metre travelled, roughly.
const MICRODEG_PER_METRE: u32 = 9;

/// Deterministic drive cycle: accelerate, cruise, brake, idle.
pub struct VehicleSimulator {
    seed: u32,
    loops: u32,
    speed_kph: u32,
    latitude: i32,
    longitude: i32,
    distance_m: u32,
}

impl VehicleSimulator {
    pub fn new(seed: u32) -> Self {
        Self {
            seed: seed.max(1),
            loops: 0,
            speed_kph: 0,
            latitude: -33_865_143,
            longitude: 151_209_900,
            distance_m: 0,
        }
    }

    pub fn distance_m(&self) -> u32 {
        self.distance_m
    }

    /// Produces the records for one loop ending at `now_ms`.
    pub fn sample(&mut self, now_ms: u32, loop_ms: u32) -> Vec<Record> {
        self.loops += 1;
        self.advance_speed();

        let travelled = self.speed_kph * loop_ms / 3_600;
        self.distance_m += travelled;
        self.latitude += i32::try_from(travelled * MICRODEG_PER_METRE).unwrap_or(0);
        self.longitude -= i32::try_from(travelled * MICRODEG_PER_METRE / 2).unwrap_or(0);

        let noise = i32::try_from(self.next() % 120).unwrap_or(0) - 60;
        let rpm = 800 + i32::try_from(self.speed_kph * 28).unwrap_or(0) + noise;

        let mut records = vec![
            Record::new(PID_SPEED, Reading::UInt(self.speed_kph), now_ms),
            Record::new(PID_RPM, Reading::Int(rpm), now_ms),
            Record::new(PID_ACC, Reading::Triple(self.accelerometer()), now_ms),
        ];

        if self.loops.is_multiple_of(GPS_EVERY) {
            records.push(Record::new(
                PID_GPS_LATITUDE,
                Reading::Coordinate(self.latitude),
                now_ms,
            ));
            records.push(Record::new(
                PID_GPS_LONGITUDE,
                Reading::Coordinate(self.longitude),
                now_ms,
            ));
        }

        records
    }

    fn advance_speed(&mut self) {
        let phase = self.loops % 240;
        self.speed_kph = match phase {
            0..60 => (self.speed_kph + 2).min(110),
            60..150 => self.speed_kph,
            150..200 => self.speed_kph.saturating_sub(3),
            _ => 0,
        };
    }

    fn accelerometer(&mut self) -> [i32; 3] {
        let mut sum = [0i32; 3];
        for _ in 0..ACC_SAMPLES_PER_LOOP {
            for (axis, rest) in sum.iter_mut().zip([0, 0, 1_000]) {
                let jitter = i32::try_from(self.next() % 41).unwrap_or(0) - 20;
                *axis += rest + jitter;
            }
        }
        sum.map(|axis| axis / ACC_SAMPLES_PER_LOOP)
    }

    fn next(&mut self) -> u32 {
        self.seed ^= self.seed << 13;
        self.seed ^= self.seed >> 17;
        self.seed ^= self.seed << 5;
        self.seed
    }
}
