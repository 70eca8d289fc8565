//! # Device Module
//!
//! The capability the service needs from a Bioplux device, and a simulated
//! device that implements it.
//!
//! ## Key Types
//! - `FrameSource`: connect, configure, subscribe, begin/end acquisition, disconnect
//! - `RawDataHandler`: callback invoked once per frame from the device's own thread
//! - `SimulatedDevice`: synthetic multi-channel signal generator running on a
//!   dedicated delivery thread, stopped through an atomic flag

use crate::error::{AcquisitionError, ConnectionError};
use crate::frame::Frame;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Sensor name the service subscribes under
pub const SENSOR_NAME: &str = "Bioplux";

/// Receives raw frames. Called from a thread the service does not own.
pub trait RawDataHandler: Send + Sync {
    fn on_raw_data(&self, source_id: &str, samples: Frame);
}

pub trait FrameSource: Send {
    fn connect(&mut self, address: &str) -> Result<(), ConnectionError>;

    fn configure_channels(&mut self, active_channels: &[u8]) -> Result<(), ConnectionError>;

    fn subscribe_raw_data(
        &mut self,
        rate: u32,
        number_of_bits: u8,
        handler: Arc<dyn RawDataHandler>,
    ) -> Result<(), ConnectionError>;

    fn begin_acquisition(&mut self, frame_buffer_size: u32) -> Result<(), AcquisitionError>;

    fn end_acquisition(&mut self) -> Result<(), AcquisitionError>;

    /// Release the device. Safe to call in any state, including before a
    /// successful connect.
    fn disconnect(&mut self) -> Result<(), ConnectionError>;
}

/// Check a `XX:XX:XX:XX:XX:XX` Bluetooth address
pub fn is_valid_mac_address(address: &str) -> bool {
    let parts: Vec<&str> = address.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Software stand-in for the Bioplux SDK.
///
/// Generates one sine wave per active channel, each at a slightly different
/// frequency, scaled to the configured bit width.
pub struct SimulatedDevice {
    address: Option<String>,
    channels: Vec<u8>,
    rate: u32,
    number_of_bits: u8,
    handler: Option<Arc<dyn RawDataHandler>>,
    /// Stop after this many frames; `None` runs until ended
    frame_limit: Option<u64>,
    /// Deliver frames as fast as possible instead of in real time
    unpaced: bool,
    should_stop: Arc<AtomicBool>,
    delivery_thread: Option<thread::JoinHandle<()>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            address: None,
            channels: Vec::new(),
            rate: 0,
            number_of_bits: 16,
            handler: None,
            frame_limit: None,
            unpaced: false,
            should_stop: Arc::new(AtomicBool::new(false)),
            delivery_thread: None,
        }
    }

    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    pub fn unpaced(mut self) -> Self {
        self.unpaced = true;
        self
    }

    pub fn is_acquiring(&self) -> bool {
        self.delivery_thread.is_some()
    }

    fn sample(channel_index: usize, tick: u64, rate: u32, number_of_bits: u8) -> i32 {
        let amplitude = f64::from((1u32 << (number_of_bits - 1)) - 1);
        let frequency = 1.0 + channel_index as f64 * 0.5;
        let t = tick as f64 / f64::from(rate);
        // 8-bit devices deliver sign-extended bytes, like the real transport
        (amplitude * (TAU * frequency * t).sin()).round() as i32
    }

    #[allow(clippy::too_many_arguments)]
    fn delivery_loop(
        handler: Arc<dyn RawDataHandler>,
        channel_count: usize,
        rate: u32,
        number_of_bits: u8,
        frame_buffer_size: u32,
        frame_limit: Option<u64>,
        unpaced: bool,
        should_stop: Arc<AtomicBool>,
    ) {
        let frame_period = Duration::from_secs_f64(1.0 / f64::from(rate));
        let started = Instant::now();
        let mut tick = 0u64;

        log::debug!("Simulated delivery started at {} Hz", rate);
        'delivery: loop {
            // The real device hands frames over in buffers of frame_buffer_size
            for _ in 0..frame_buffer_size.max(1) {
                if should_stop.load(Ordering::Relaxed) {
                    break 'delivery;
                }
                if frame_limit.is_some_and(|limit| tick >= limit) {
                    break 'delivery;
                }

                let frame: Frame = (0..channel_count)
                    .map(|i| Self::sample(i, tick, rate, number_of_bits))
                    .collect();
                handler.on_raw_data(SENSOR_NAME, frame);
                tick += 1;
            }

            if !unpaced {
                let due = frame_period.mul_f64(tick as f64);
                if let Some(wait) = due.checked_sub(started.elapsed()) {
                    thread::sleep(wait.min(Duration::from_millis(100)));
                }
            }
        }
        log::debug!("Simulated delivery stopped after {} frames", tick);
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for SimulatedDevice {
    fn connect(&mut self, address: &str) -> Result<(), ConnectionError> {
        if !is_valid_mac_address(address) {
            return Err(ConnectionError::InvalidAddress(address.to_string()));
        }
        log::info!("Simulated device connected at {}", address);
        self.address = Some(address.to_string());
        Ok(())
    }

    fn configure_channels(&mut self, active_channels: &[u8]) -> Result<(), ConnectionError> {
        if self.address.is_none() {
            return Err(ConnectionError::ChannelSetup("device not connected".to_string()));
        }
        if active_channels.is_empty() {
            return Err(ConnectionError::ChannelSetup("no channels requested".to_string()));
        }
        self.channels = active_channels.to_vec();
        Ok(())
    }

    fn subscribe_raw_data(
        &mut self,
        rate: u32,
        number_of_bits: u8,
        handler: Arc<dyn RawDataHandler>,
    ) -> Result<(), ConnectionError> {
        if self.channels.is_empty() {
            return Err(ConnectionError::Subscribe("channels not configured".to_string()));
        }
        if rate == 0 || !(2..=16).contains(&number_of_bits) {
            return Err(ConnectionError::Subscribe(format!(
                "unsupported stream {} Hz / {} bits",
                rate, number_of_bits
            )));
        }
        self.rate = rate;
        self.number_of_bits = number_of_bits;
        self.handler = Some(handler);
        Ok(())
    }

    fn begin_acquisition(&mut self, frame_buffer_size: u32) -> Result<(), AcquisitionError> {
        if self.address.is_none() {
            return Err(AcquisitionError::NotConnected);
        }
        if self.delivery_thread.is_some() {
            return Err(AcquisitionError::Begin("acquisition already running".to_string()));
        }
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| AcquisitionError::Begin("no raw data subscription".to_string()))?;

        let should_stop = Arc::new(AtomicBool::new(false));
        self.should_stop = should_stop.clone();

        let channel_count = self.channels.len();
        let (rate, bits, limit, unpaced) =
            (self.rate, self.number_of_bits, self.frame_limit, self.unpaced);
        let handle = thread::Builder::new()
            .name("bplux-delivery".to_string())
            .spawn(move || {
                Self::delivery_loop(
                    handler,
                    channel_count,
                    rate,
                    bits,
                    frame_buffer_size,
                    limit,
                    unpaced,
                    should_stop,
                )
            })
            .map_err(|e| AcquisitionError::Begin(e.to_string()))?;

        self.delivery_thread = Some(handle);
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<(), AcquisitionError> {
        let handle = self.delivery_thread.take().ok_or(AcquisitionError::NotConnected)?;
        self.should_stop.store(true, Ordering::Relaxed);
        handle
            .join()
            .map_err(|_| AcquisitionError::End("delivery thread panicked".to_string()))
    }

    fn disconnect(&mut self) -> Result<(), ConnectionError> {
        if self.delivery_thread.is_some() {
            if let Err(e) = self.end_acquisition() {
                log::warn!("{}", e);
            }
        }
        self.handler = None;
        self.channels.clear();
        if let Some(address) = self.address.take() {
            log::info!("Simulated device at {} disconnected", address);
        }
        Ok(())
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collector {
        frames: Mutex<Vec<Frame>>,
    }

    impl RawDataHandler for Collector {
        fn on_raw_data(&self, source_id: &str, samples: Frame) {
            assert_eq!(source_id, SENSOR_NAME);
            self.frames.lock().unwrap().push(samples);
        }
    }

    #[test]
    fn test_mac_address_validation() {
        assert!(is_valid_mac_address("00:07:80:4D:2E:76"));
        assert!(!is_valid_mac_address("00:07:80:4D:2E"));
        assert!(!is_valid_mac_address("00:07:80:4D:2E:7G"));
        assert!(!is_valid_mac_address("test"));
    }

    #[test]
    fn test_connect_rejects_bad_address() {
        let mut device = SimulatedDevice::new();
        assert!(matches!(
            device.connect("nope"),
            Err(ConnectionError::InvalidAddress(_))
        ));
        assert!(matches!(device.begin_acquisition(10), Err(AcquisitionError::NotConnected)));
    }

    #[test]
    fn test_delivers_frame_limit() {
        let collector = Arc::new(Collector::default());
        let mut device = SimulatedDevice::new().with_frame_limit(250).unpaced();

        device.connect("00:07:80:4D:2E:76").unwrap();
        device.configure_channels(&[1, 2, 3]).unwrap();
        device.subscribe_raw_data(1000, 12, collector.clone()).unwrap();
        device.begin_acquisition(10).unwrap();
        assert!(device.is_acquiring());

        // Ending joins the delivery thread, which exits on its own at the limit
        while collector.frames.lock().unwrap().len() < 250 {
            thread::sleep(Duration::from_millis(1));
        }
        device.end_acquisition().unwrap();

        let frames = collector.frames.lock().unwrap();
        assert_eq!(frames.len(), 250);
        assert!(frames.iter().all(|f| f.len() == 3));
        assert!(frames.iter().flatten().all(|v| v.abs() <= 2047));
    }

    #[test]
    fn test_end_stops_paced_delivery() {
        let collector = Arc::new(Collector::default());
        let mut device = SimulatedDevice::new();

        device.connect("00:07:80:4D:2E:76").unwrap();
        device.configure_channels(&[1]).unwrap();
        device.subscribe_raw_data(100, 8, collector.clone()).unwrap();
        device.begin_acquisition(1).unwrap();
        thread::sleep(Duration::from_millis(50));
        device.end_acquisition().unwrap();

        let delivered = collector.frames.lock().unwrap().len();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(collector.frames.lock().unwrap().len(), delivered);
        assert!(device.end_acquisition().is_err());
    }

    #[test]
    fn test_disconnect_stops_delivery_and_forgets_subscription() {
        let collector = Arc::new(Collector::default());
        let mut device = SimulatedDevice::new();
        device.disconnect().unwrap();

        device.connect("00:07:80:4D:2E:76").unwrap();
        device.configure_channels(&[1, 2]).unwrap();
        device.subscribe_raw_data(100, 12, collector.clone()).unwrap();
        device.begin_acquisition(1).unwrap();

        device.disconnect().unwrap();
        assert!(!device.is_acquiring());
        let delivered = collector.frames.lock().unwrap().len();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(collector.frames.lock().unwrap().len(), delivered);

        assert!(matches!(device.begin_acquisition(1), Err(AcquisitionError::NotConnected)));
        assert!(device.configure_channels(&[1]).is_err());
    }
}
