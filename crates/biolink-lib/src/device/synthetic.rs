use super::{
    AcquisitionDevice, BatteryLevel, DeviceError, ReleaseHandle, SampleCallback, SYNTHETIC_ADDRESS,
};
use crate::channels::channels_in_mask;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Deterministic 1 Hz sine on every active channel, scaled to the full
/// sample range.
///
/// Paced mode delivers frames at the sample rate and catches up on frames
/// missed by oversleeping; unpaced mode delivers as fast as the consumer
/// takes them.
pub struct SyntheticDevice {
    paced: bool,
    limit: Option<u64>,
    noise: Option<(f64, u64)>,
    sample_rate: u32,
    channels: usize,
    data_max: f64,
    next_frame: u64,
    started: bool,
    released: Arc<AtomicBool>,
}

impl SyntheticDevice {
    pub fn new() -> Self {
        Self {
            paced: true,
            limit: None,
            noise: None,
            sample_rate: 0,
            channels: 0,
            data_max: 0.0,
            next_frame: 0,
            started: false,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn unpaced() -> Self {
        Self {
            paced: false,
            ..Self::new()
        }
    }

    /// Stop producing after `frames` frames, as if the link went silent.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Add seeded uniform noise of +/- `amplitude` counts.
    pub fn with_noise(mut self, amplitude: f64, seed: u64) -> Self {
        self.noise = Some((amplitude, seed));
        self
    }

    /// Value every channel carries at `frame`, before noise.
    pub fn value_at(&self, frame: u64) -> u16 {
        let mean = self.data_max / 2.0;
        let phase = frame as f64 * 2.0 * PI / self.sample_rate as f64;
        (phase.sin() * mean + mean).round() as u16
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Default for SyntheticDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionDevice for SyntheticDevice {
    fn address(&self) -> &str {
        SYNTHETIC_ADDRESS
    }

    fn properties(&self) -> String {
        format!(
            "synthetic waveform device ({})",
            if self.paced { "paced" } else { "unpaced" }
        )
    }

    fn start(
        &mut self,
        sample_rate: u32,
        channel_mask: u8,
        bit_width: u8,
    ) -> Result<(), DeviceError> {
        if sample_rate == 0 {
            return Err(DeviceError::Start("sample rate must be positive".into()));
        }
        if channel_mask == 0 {
            return Err(DeviceError::Start("no channel selected".into()));
        }
        if bit_width == 0 || bit_width > 16 {
            return Err(DeviceError::Start(format!(
                "unsupported resolution of {} bits",
                bit_width
            )));
        }
        self.sample_rate = sample_rate;
        self.channels = channels_in_mask(channel_mask);
        self.data_max = ((1u32 << bit_width) - 1) as f64;
        self.next_frame = 0;
        self.started = true;
        Ok(())
    }

    fn run(&mut self, on_sample: &mut SampleCallback<'_>) -> Result<(), DeviceError> {
        if !self.started {
            return Err(DeviceError::Acquisition("device not started".into()));
        }
        if self.is_released() {
            return Err(DeviceError::Acquisition("device was released".into()));
        }
        let period = Duration::from_secs_f64(1.0 / self.sample_rate as f64);
        let mut rng = self.noise.map(|(_, seed)| StdRng::seed_from_u64(seed));
        let mut values = vec![0u16; self.channels];
        let mut next_tick = Instant::now() + period;
        loop {
            if self.paced {
                let now = Instant::now();
                if next_tick > now {
                    thread::sleep(next_tick - now);
                }
            }
            // deliver every frame that is due, so oversleeping never slows the rate
            while !self.paced || next_tick <= Instant::now() {
                if self.is_released() {
                    self.started = false;
                    return Ok(());
                }
                if let Some(limit) = self.limit {
                    if self.next_frame >= limit {
                        return Ok(());
                    }
                }
                let base = self.value_at(self.next_frame) as f64;
                let value = match (rng.as_mut(), self.noise) {
                    (Some(rng), Some((amplitude, _))) => {
                        (base + rng.gen_range(-amplitude..=amplitude)).clamp(0.0, self.data_max)
                    }
                    _ => base,
                };
                values.iter_mut().for_each(|v| *v = value as u16);
                let frame = self.next_frame;
                self.next_frame += 1;
                next_tick += period;
                if on_sample(frame, &values) {
                    return Ok(());
                }
            }
        }
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.started = false;
        Ok(())
    }

    fn close(&mut self) {
        self.started = false;
    }

    fn release_handle(&self) -> ReleaseHandle {
        let released = Arc::clone(&self.released);
        Arc::new(move || released.store(true, Ordering::Release))
    }

    fn battery(&self) -> Result<BatteryLevel, DeviceError> {
        Ok(BatteryLevel::Percent(100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_consecutive_frames_with_one_value_per_channel() {
        let mut device = SyntheticDevice::unpaced();
        device.start(1000, 0x07, 16).unwrap();
        let mut seen = Vec::new();
        device
            .run(&mut |frame, values| {
                assert_eq!(values.len(), 3);
                seen.push(frame);
                frame == 9
            })
            .unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn waveform_is_deterministic_and_spans_full_scale() {
        let mut device = SyntheticDevice::unpaced();
        device.start(1000, 0x01, 16).unwrap();
        assert_eq!(device.value_at(0), 32768);
        assert_eq!(device.value_at(250), 65535);
        assert_eq!(device.value_at(750), 0);
    }

    #[test]
    fn limit_ends_the_loop() {
        let mut device = SyntheticDevice::unpaced().with_limit(5);
        device.start(100, 0x03, 16).unwrap();
        let mut count = 0;
        device
            .run(&mut |_, _| {
                count += 1;
                false
            })
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn seeded_noise_repeats() {
        let collect = || {
            let mut device = SyntheticDevice::unpaced().with_limit(20).with_noise(50.0, 7);
            device.start(100, 0x01, 16).unwrap();
            let mut out = Vec::new();
            device
                .run(&mut |_, values| {
                    out.push(values[0]);
                    false
                })
                .unwrap();
            out
        };
        assert_eq!(collect(), collect());
    }

    #[test]
    fn paced_mode_keeps_the_sample_rate() {
        let mut device = SyntheticDevice::new();
        device.start(1000, 0x01, 16).unwrap();
        let started = Instant::now();
        device.run(&mut |frame, _| frame == 199).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(190));
    }

    #[test]
    fn release_from_another_thread_ends_run() {
        let mut device = SyntheticDevice::new();
        device.start(1000, 0x01, 16).unwrap();
        let release = device.release_handle();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            release();
        });
        let mut frames = 0u64;
        device
            .run(&mut |_, _| {
                frames += 1;
                false
            })
            .unwrap();
        releaser.join().unwrap();
        assert!(device.is_released());
        assert!(frames > 0);
        assert!(device.run(&mut |_, _| false).is_err());
    }

    #[test]
    fn rejects_empty_mask() {
        let mut device = SyntheticDevice::new();
        assert!(device.start(1000, 0, 16).is_err());
    }
}
