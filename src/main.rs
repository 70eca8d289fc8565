use bplux_recorder::client::{ClientMessage, ServiceMessage, CODE_ERROR_SAVING_RECORDING};
use bplux_recorder::config::{DeviceConfiguration, SessionRequest, Settings};
use bplux_recorder::device::{self, SimulatedDevice};
use bplux_recorder::error::ConnectionError;
use bplux_recorder::service::{self, AcquisitionService, LogHost, StopRequest};
use bplux_recorder::storage::{DataManager, DataSink};
use clap::Parser;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Record a Bioplux session to disk while streaming a decimated preview
#[derive(Debug, Parser)]
#[command(name = "bplux-recorder", version)]
struct Cli {
    /// Recording name, also used for the output file
    #[arg(short, long, default_value = "recording")]
    name: String,

    /// Device Bluetooth address
    #[arg(short, long, default_value = "00:07:80:4D:2E:76")]
    address: String,

    /// Active channels, comma separated
    #[arg(short, long, value_delimiter = ',', default_values_t = [1u8, 2])]
    channels: Vec<u8>,

    /// Sample width in bits (8, 12 or 16)
    #[arg(short, long, default_value_t = 12)]
    bits: u8,

    /// Acquisition sampling frequency in Hz
    #[arg(long, default_value_t = 1000)]
    sampling_frequency: u32,

    /// Display frequency in Hz
    #[arg(long, default_value_t = 100)]
    visualization_frequency: u32,

    /// Stop after this many seconds; runs until Ctrl-C when omitted
    #[arg(short, long)]
    duration: Option<u64>,

    /// Settings file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run without the console client
    #[arg(long)]
    no_client: bool,
}

/// Events from the process supervisor to the controller loop
#[derive(Debug, Clone, Copy)]
enum Supervision {
    /// First Ctrl-C: stop and store the recording
    Shutdown,
    /// Second Ctrl-C: the host is reclaiming the process
    Kill,
}

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .unwrap_or_else(|e| {
        log::warn!("{}; using default settings", e);
        Settings::default()
    });

    let request = SessionRequest {
        recording_name: cli.name.clone(),
        configuration: DeviceConfiguration {
            name: device::SENSOR_NAME.to_string(),
            mac_address: cli.address.clone(),
            active_channels: cli.channels.clone(),
            number_of_bits: cli.bits,
            sampling_frequency: cli.sampling_frequency,
            visualization_frequency: cli.visualization_frequency,
        },
    };

    let (signal_tx, signal_rx) = unbounded();
    if let Err(e) = spawn_signal_listener(signal_tx) {
        log::error!("{}", e);
    }

    let output_dir = settings.output_dir.clone();
    let sink_factory: service::SinkFactory = Box::new(move |request: &SessionRequest| {
        let manager =
            DataManager::create(&output_dir, &request.recording_name, &request.configuration)?;
        Ok(Arc::new(manager) as Arc<dyn DataSink>)
    });

    let (mut service, stop_rx) = AcquisitionService::new(
        SimulatedDevice::new(),
        settings,
        Arc::new(LogHost),
        sink_factory,
    );

    let client_thread = if cli.no_client {
        None
    } else {
        let (client_tx, client_rx) = unbounded();
        service.bind();
        service.handle_message(ServiceMessage::RegisterClient(Box::new(client_tx)));
        Some(thread::spawn(move || run_console_client(client_rx)))
    };

    service.start(request);
    if let Some(seconds) = cli.duration {
        service.handle_message(ServiceMessage::RecordingDuration(format_duration(seconds)));
    }

    let deadline = match cli.duration {
        Some(seconds) => crossbeam_channel::after(Duration::from_secs(seconds)),
        None => crossbeam_channel::never(),
    };

    supervise(&mut service, &stop_rx, &signal_rx, &deadline);

    if let Some(finalizer) = service.destroy() {
        if finalizer.join().is_err() {
            log::error!("Finalize worker panicked");
        }
    }
    while let Ok(request) = stop_rx.try_recv() {
        log::info!("Stop requested after teardown: {:?}", request);
    }

    // Dropping the service drops the client's sender and ends the console client
    drop(service);
    if let Some(handle) = client_thread {
        let _ = handle.join();
    }
}

/// Wait until something asks the session to end
fn supervise(
    service: &mut AcquisitionService<SimulatedDevice>,
    stop_rx: &Receiver<StopRequest>,
    signal_rx: &Receiver<Supervision>,
    deadline: &Receiver<std::time::Instant>,
) {
    let mut signals = signal_rx.clone();
    loop {
        select! {
            recv(stop_rx) -> request => {
                log::warn!("Service requested stop: {:?}", request);
                break;
            }
            recv(signals) -> event => {
                match event {
                    Ok(Supervision::Shutdown) => {
                        log::info!("Stopping recording");
                        break;
                    }
                    Ok(Supervision::Kill) => {
                        service.task_removed();
                        break;
                    }
                    // Listener is gone; keep waiting on the other sources
                    Err(_) => signals = crossbeam_channel::never(),
                }
            }
            recv(deadline) -> _ => {
                log::info!("Recording duration reached");
                break;
            }
        }
    }

    // A second Ctrl-C while the recording is being stopped means give up
    if let Ok(Supervision::Kill) = signal_rx.try_recv() {
        service.task_removed();
    }
}

/// Forward Ctrl-C from a Tokio runtime thread: first press stops, second kills
fn spawn_signal_listener(sender: Sender<Supervision>) -> Result<(), ConnectionError> {
    let rt = Runtime::new().map_err(|e| ConnectionError::RuntimeCreation(e.to_string()))?;

    thread::spawn(move || {
        rt.block_on(async move {
            for event in [Supervision::Shutdown, Supervision::Kill] {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Could not listen for Ctrl-C: {}", e);
                    return;
                }
                if sender.send(event).is_err() {
                    return;
                }
            }
        });
    });
    Ok(())
}

/// Console stand-in for the UI: logs what a plotting client would receive
fn run_console_client(receiver: Receiver<ClientMessage>) {
    let mut samples = 0u64;

    while let Ok(message) = receiver.recv() {
        match message {
            ClientMessage::Data { x_value, frame } => {
                samples += 1;
                if samples % 100 == 0 {
                    log::info!("t = {:.0} ms  frame = {:?}", x_value, frame);
                } else {
                    log::trace!("t = {:.0} ms  frame = {:?}", x_value, frame);
                }
            }
            ClientMessage::Saved => log::info!("Client: recording saved"),
            ClientMessage::ConnectionError { code } if code == CODE_ERROR_SAVING_RECORDING => {
                log::error!("Client: recording could not be saved");
            }
            ClientMessage::ConnectionError { code } => {
                log::error!("Client: service reported error code {}", code);
            }
        }
    }
    log::debug!("Client: {} display samples received", samples);
}

fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}:{:02}", seconds / 3600, (seconds / 60) % 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00:00");
        assert_eq!(format_duration(3725), "01:02:05");
    }

    #[test]
    fn test_cli_parses_channels() {
        let cli = Cli::parse_from(["bplux-recorder", "-c", "1,3,5", "--bits", "8", "-d", "2"]);
        assert_eq!(cli.channels, vec![1, 3, 5]);
        assert_eq!(cli.bits, 8);
        assert_eq!(cli.duration, Some(2));
        assert!(!cli.no_client);
    }

    #[test]
    fn test_simulated_session_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().to_path_buf();
        let settings = Settings {
            output_dir: output_dir.clone(),
            drain_poll_ms: 5,
            ..Settings::default()
        };
        let factory: service::SinkFactory = Box::new(move |request: &SessionRequest| {
            let manager =
                DataManager::create(&output_dir, &request.recording_name, &request.configuration)?;
            Ok(Arc::new(manager) as Arc<dyn DataSink>)
        });

        let (mut service, _stop_rx) = AcquisitionService::new(
            SimulatedDevice::new().with_frame_limit(500).unpaced(),
            settings,
            Arc::new(LogHost),
            factory,
        );
        let (client_tx, client_rx) = unbounded();
        service.handle_message(ServiceMessage::RegisterClient(Box::new(client_tx)));
        service.start(SessionRequest {
            recording_name: "e2e".to_string(),
            configuration: DeviceConfiguration {
                name: device::SENSOR_NAME.to_string(),
                mac_address: "00:07:80:4D:2E:76".to_string(),
                active_channels: vec![1, 2],
                number_of_bits: 8,
                sampling_frequency: 1000,
                visualization_frequency: 100,
            },
        });

        // Wait for the simulated device to deliver all its frames
        let mut data = 0;
        while data < 50 {
            match client_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                ClientMessage::Data { frame, .. } => {
                    assert!(frame.iter().all(|v| (0..=255).contains(v)));
                    data += 1;
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        service.destroy().unwrap().join().unwrap();
        assert_eq!(client_rx.recv_timeout(Duration::from_secs(5)).unwrap(), ClientMessage::Saved);
        assert!(dir.path().join("e2e.txt.zst").exists());
        assert!(!dir.path().join("e2e.tmp").exists());
    }
}
