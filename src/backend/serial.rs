//! Serial port links
//!
//! Opens the scope and control panel ports with the `serialport` crate. Both
//! ports use 8 data bits, no parity and one stop bit; the scope additionally
//! uses RTS/CTS flow control. Opening is attempted once, retrying is up to the
//! caller.

use crate::backend::link::SerialLink;
use crate::config::{PanelConfig, ScopeLinkConfig};
use crate::error::{Result, ResultExt};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Stand-in for "no timeout"; serialport always needs a finite duration
const BLOCKING_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24);

/// A [`SerialLink`] backed by an operating system serial port
pub struct PortLink {
    name: String,
    port: Box<dyn SerialPort>,
}

impl PortLink {
    /// Open the scope port
    pub fn open_scope(name: &str, config: &ScopeLinkConfig) -> Result<Self> {
        let flow_control = if config.hardware_flow_control {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };
        let timeout = config.read_timeout().unwrap_or(BLOCKING_TIMEOUT);
        Self::open(name, config.baud_rate, flow_control, timeout)
    }

    /// Open the control panel port
    pub fn open_panel(name: &str, config: &PanelConfig) -> Result<Self> {
        Self::open(name, config.baud_rate, FlowControl::None, config.read_timeout())
    }

    fn open(name: &str, baud_rate: u32, flow_control: FlowControl, timeout: Duration) -> Result<Self> {
        let port = serialport::new(name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(flow_control)
            .timeout(timeout)
            .open()
            .with_context(|| format!("Failed to open serial port '{}' at {} baud", name, baud_rate))?;

        tracing::info!(
            "Serial port '{}' opened at {} baud (timeout {:?}, flow control {:?})",
            name,
            baud_rate,
            timeout,
            flow_control
        );

        Ok(Self {
            name: name.to_string(),
            port,
        })
    }
}

impl Read for PortLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for PortLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialLink for PortLink {
    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>> {
        let port = self
            .port
            .try_clone()
            .with_context(|| format!("Failed to clone serial port '{}'", self.name))?;
        Ok(Box::new(PortLink {
            name: self.name.clone(),
            port,
        }))
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.name)
    }
}
