#![doc = include_str!("../readme.md")]

pub mod bus;
pub mod config;
pub mod device;
pub mod devices;
pub mod error;
pub mod reader;
pub mod stream;
pub mod transport;
pub mod tuner;

pub use config::{DeviceConfig, DEFAULT_BUF_LENGTH, DEFAULT_BUF_NUM, DEFAULT_XTAL_FREQ};
pub use device::{synthesize_rate, RtlSdr, SampleRate, MAX_SAMPLE_RATE};
pub use devices::{device_count, device_name, list_devices, DeviceInfo, KnownDevice};
pub use error::{Error, Result, RtlErrorCode};
pub use reader::{AsyncSampleReader, ReaderConfig, SampleReader, TunerSetting};
pub use stream::Canceller;
pub use transport::{Transfer, TransferStatus, Transport, UsbTransport};
pub use tuner::{BareTuners, Tuner, TunerBus, TunerFactory, TunerFamily};
