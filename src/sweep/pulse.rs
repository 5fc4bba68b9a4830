//! Pulse-program execution between write and read.
//!
//! When a sweep step must fire a pulse sequence, the controller hands the
//! step to a [`PulseConfig`]: an abstract waveform generator, an abstract
//! acquisition instrument, and the pulse program that supplies per-channel
//! waveforms. The concrete instruments live outside this crate (only their
//! contracts are defined here), and waveform *generation* is likewise the
//! program's problem; this module only moves the data and sequences the
//! trigger/acquire handshake.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Sample data and marker bits for one generator channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f64>,
    pub markers: Vec<u8>,
}

/// Run mode of a waveform generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Continuous,
    Triggered,
}

/// Contract for the arbitrary waveform generator driving the pulses.
#[async_trait]
pub trait WaveformGenerator: Send + Sync {
    /// Enable or disable the generator output.
    async fn set_enabled(&self, enabled: bool) -> Result<()>;

    /// Set the output sampling rate in hertz.
    async fn set_sampling_rate(&self, hz: f64) -> Result<()>;

    /// Select the run mode.
    async fn set_run_mode(&self, mode: RunMode) -> Result<()>;

    /// Drop all loaded waveforms.
    async fn clear_channels(&self) -> Result<()>;

    /// Load a named waveform (with markers) onto a channel.
    async fn load_waveform(&self, channel: usize, name: &str, waveform: &Waveform) -> Result<()>;

    /// Enable or disable one output channel.
    async fn set_channel_enabled(&self, channel: usize, enabled: bool) -> Result<()>;

    /// Fire a software trigger.
    async fn trigger(&self) -> Result<()>;

    /// Block until the generator reports the current operation complete.
    async fn opc(&self) -> Result<()>;
}

/// Contract for the acquisition instrument capturing the response.
#[async_trait]
pub trait Digitizer: Send + Sync {
    /// Start or stop acquiring.
    async fn set_acquiring(&self, acquiring: bool) -> Result<()>;

    /// Average `frames` triggered frames into one record.
    async fn set_frame_averaging(&self, frames: u32) -> Result<()>;

    /// Capture single frames without averaging.
    async fn disable_frame_averaging(&self) -> Result<()>;

    /// Stop after one complete trigger sequence.
    async fn set_single_sequence(&self) -> Result<()>;

    /// Number of acquisitions made since acquisition started.
    async fn acquisition_count(&self) -> Result<u32>;

    /// Block until the digitizer reports the current operation complete.
    async fn opc(&self) -> Result<()>;
}

/// Supplies the waveforms and timing of a pulse sequence.
pub trait PulseProgram: Send + Sync {
    /// Generator sampling rate in hertz.
    fn sampling_rate(&self) -> f64;

    /// Number of trigger/acquire repetitions per sweep step.
    fn repetitions(&self) -> u32;

    /// Wall-clock delay to wait out after each trigger.
    fn acquisition_delay(&self) -> Duration;

    /// Per-output waveforms, keyed by output name.
    fn waveforms(&self) -> Result<HashMap<String, Waveform>>;
}

/// The configuration necessary to execute a pulse program with a device.
pub struct PulseConfig {
    program: Arc<dyn PulseProgram>,
    /// Output name → generator channel number.
    channels: HashMap<String, usize>,
    generator: Arc<dyn WaveformGenerator>,
    digitizer: Arc<dyn Digitizer>,
    trigger_arm_delay: Duration,
}

impl PulseConfig {
    pub fn new(
        program: Arc<dyn PulseProgram>,
        channels: HashMap<String, usize>,
        generator: Arc<dyn WaveformGenerator>,
        digitizer: Arc<dyn Digitizer>,
    ) -> Self {
        Self {
            program,
            channels,
            generator,
            digitizer,
            // Real digitizers need a moment between acquisition start and
            // the first trigger.
            trigger_arm_delay: Duration::from_secs(1),
        }
    }

    /// Override the delay between acquisition start and the first trigger.
    pub fn with_trigger_arm_delay(mut self, delay: Duration) -> Self {
        self.trigger_arm_delay = delay;
        self
    }

    /// One-time generator setup, run on the first sweep pass.
    pub async fn configure_devices(&self) -> Result<()> {
        debug!("configuring pulse devices");

        self.generator.set_enabled(false).await?;
        self.generator
            .set_sampling_rate(self.program.sampling_rate())
            .await?;
        self.generator.set_run_mode(RunMode::Triggered).await?;
        Ok(())
    }

    /// Run through the pulse program once.
    ///
    /// Loads the program's waveforms, arms the digitizer (averaging when more
    /// than one repetition is requested), fires the trigger/acquire loop, and
    /// verifies the digitizer captured exactly the requested repetitions.
    pub async fn execute(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Ok(());
        }

        let waveforms = self.program.waveforms()?;
        let repetitions = self.program.repetitions();

        self.generator.set_enabled(false).await?;
        self.generator.clear_channels().await?;

        let mut loaded = Vec::with_capacity(self.channels.len());
        for (output, &channel) in &self.channels {
            let waveform = waveforms
                .get(output)
                .ok_or_else(|| anyhow!("pulse program has no waveform for output '{}'", output))?;
            self.generator.load_waveform(channel, output, waveform).await?;
            loaded.push(channel);
        }

        for &channel in &loaded {
            self.generator.set_channel_enabled(channel, true).await?;
        }
        self.generator.set_enabled(true).await?;

        self.digitizer.set_acquiring(false).await?;
        if repetitions > 1 {
            self.digitizer.set_frame_averaging(repetitions).await?;
        } else {
            self.digitizer.disable_frame_averaging().await?;
        }
        self.digitizer.set_single_sequence().await?;

        self.generator.opc().await?;
        self.digitizer.opc().await?;

        self.digitizer.set_acquiring(true).await?;
        sleep(self.trigger_arm_delay).await;

        let delay = self.program.acquisition_delay();
        for _ in 0..repetitions {
            self.generator.trigger().await?;
            self.generator.opc().await?;
            sleep(delay).await;
        }

        self.digitizer.opc().await?;

        let acquisitions = self.digitizer.acquisition_count().await?;
        if acquisitions != repetitions {
            bail!(
                "incorrect number of acquisitions made: {} (expected {})",
                acquisitions,
                repetitions
            );
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Reusable mock pulse instruments.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    pub struct MockProgram {
        pub repetitions: u32,
    }

    impl PulseProgram for MockProgram {
        fn sampling_rate(&self) -> f64 {
            1.0e9
        }

        fn repetitions(&self) -> u32 {
            self.repetitions
        }

        fn acquisition_delay(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn waveforms(&self) -> Result<HashMap<String, Waveform>> {
            let mut map = HashMap::new();
            map.insert(
                "gate".to_string(),
                Waveform {
                    samples: vec![0.0, 1.0, 0.0],
                    markers: vec![0, 1, 0],
                },
            );
            Ok(map)
        }
    }

    #[derive(Default)]
    pub struct MockGenerator {
        pub log: Mutex<Vec<String>>,
        pub triggers: AtomicU32,
    }

    #[async_trait]
    impl WaveformGenerator for MockGenerator {
        async fn set_enabled(&self, enabled: bool) -> Result<()> {
            self.log.lock().unwrap().push(format!("enabled={}", enabled));
            Ok(())
        }

        async fn set_sampling_rate(&self, hz: f64) -> Result<()> {
            self.log.lock().unwrap().push(format!("rate={}", hz));
            Ok(())
        }

        async fn set_run_mode(&self, mode: RunMode) -> Result<()> {
            self.log.lock().unwrap().push(format!("mode={:?}", mode));
            Ok(())
        }

        async fn clear_channels(&self) -> Result<()> {
            self.log.lock().unwrap().push("clear".to_string());
            Ok(())
        }

        async fn load_waveform(&self, channel: usize, name: &str, _w: &Waveform) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("load {} on {}", name, channel));
            Ok(())
        }

        async fn set_channel_enabled(&self, channel: usize, enabled: bool) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("channel {} enabled={}", channel, enabled));
            Ok(())
        }

        async fn trigger(&self) -> Result<()> {
            self.triggers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn opc(&self) -> Result<()> {
            Ok(())
        }
    }

    pub struct MockDigitizer {
        pub acquiring: AtomicBool,
        pub averaging: AtomicU32,
        pub reported_acquisitions: u32,
    }

    impl MockDigitizer {
        pub fn reporting(acquisitions: u32) -> Self {
            Self {
                acquiring: AtomicBool::new(false),
                averaging: AtomicU32::new(0),
                reported_acquisitions: acquisitions,
            }
        }
    }

    #[async_trait]
    impl Digitizer for MockDigitizer {
        async fn set_acquiring(&self, acquiring: bool) -> Result<()> {
            self.acquiring.store(acquiring, Ordering::SeqCst);
            Ok(())
        }

        async fn set_frame_averaging(&self, frames: u32) -> Result<()> {
            self.averaging.store(frames, Ordering::SeqCst);
            Ok(())
        }

        async fn disable_frame_averaging(&self) -> Result<()> {
            self.averaging.store(0, Ordering::SeqCst);
            Ok(())
        }

        async fn set_single_sequence(&self) -> Result<()> {
            Ok(())
        }

        async fn acquisition_count(&self) -> Result<u32> {
            Ok(self.reported_acquisitions)
        }

        async fn opc(&self) -> Result<()> {
            Ok(())
        }
    }
}
