//! Provides a serial port logger implementation.
//!
//! Logging over a serial port is handy for hypervisor / UEFI style
//! environments where there is no stdout. Every line is tagged with the APIC
//! id of the logical processor, so exits of different vCPUs can be told apart.

use {
    crate::intel::support::{inb, outb},
    core::{fmt, fmt::Write},
    spin::{Mutex, Once},
};

/// UART register offsets
const UART_OFFSET_DATA: u16 = 0x0;
const UART_OFFSET_INTERRUPT_ENABLE: u16 = 0x1;
const UART_OFFSET_FIFO_CONTROL: u16 = 0x2;
const UART_OFFSET_LINE_CONTROL: u16 = 0x3;
const UART_OFFSET_MODEM_CONTROL: u16 = 0x4;
const UART_OFFSET_LINE_STATUS: u16 = 0x5;
const UART_OFFSET_TRANSMITTER_HOLDING_BUFFER: u16 = 0x0;

static SERIAL_LOGGER: Once<SerialLogger> = Once::new();

/// Initializes the serial logger and installs it as the global `log` logger.
///
/// Calling it again only updates the max log level.
pub fn init(port: SerialPort, level: log::LevelFilter) {
    let mut installed = false;

    let logger = SERIAL_LOGGER.call_once(|| {
        installed = true;
        SerialLogger::new(port)
    });

    // Another logger may already be registered; keep logging to it.
    if installed {
        let _ = log::set_logger(logger);
    }

    log::set_max_level(level);
}

/// Serial ports supported by the logger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SerialPort {
    /// COM1 (0x3F8)
    COM1 = 0x3F8,
    /// COM2 (0x2F8)
    COM2 = 0x2F8,
}

/// The actual logger that implements `log::Log`.
pub struct SerialLogger {
    port: Mutex<Serial>,
}

impl SerialLogger {
    fn new(port: SerialPort) -> Self {
        let mut serial = Serial { port };
        serial.init();

        Self { port: Mutex::new(serial) }
    }
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let mut serial = self.port.lock();
            let _ = format_record(&mut *serial, apic_id(), record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Formats one log line: `vcpu-<id> <LEVEL>: <message>`.
pub fn format_record(out: &mut impl Write, vcpu_id: u32, level: log::Level, args: &fmt::Arguments<'_>) -> fmt::Result {
    writeln!(out, "vcpu-{} {}: {}", vcpu_id, level, args)
}

/// Low-level serial writer.
struct Serial {
    port: SerialPort,
}

impl Serial {
    fn init(&mut self) {
        let base = self.port as u16;

        // Disable interrupts
        outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        // Enable DLAB
        outb(base + UART_OFFSET_LINE_CONTROL, 0x80);
        // Divisor = 3 -> 38400 baud (for 115200 base)
        outb(base + UART_OFFSET_DATA, 0x03);
        outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        // 8 bits, no parity, one stop bit
        outb(base + UART_OFFSET_LINE_CONTROL, 0x03);
        // Enable FIFO, clear, 14-byte threshold
        outb(base + UART_OFFSET_FIFO_CONTROL, 0xC7);
        // IRQs enabled, RTS/DSR set
        outb(base + UART_OFFSET_MODEM_CONTROL, 0x0B);
    }

    fn write_byte(&mut self, byte: u8) {
        let base = self.port as u16;
        // Wait until TX empty
        while (inb(base + UART_OFFSET_LINE_STATUS) & 0x20) == 0 {}
        outb(base + UART_OFFSET_TRANSMITTER_HOLDING_BUFFER, byte);
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(b);
        }
        Ok(())
    }
}

/// Returns the current processor's initial APIC ID.
fn apic_id() -> u32 {
    x86::cpuid::cpuid!(0x1).ebx >> 24
}

/// `log` backend for host tests. Messages are kept per thread, so parallel
/// tests only see their own output.
#[cfg(test)]
pub(crate) mod capture {
    use std::{cell::RefCell, format, string::String, sync::Once, vec::Vec};

    struct CaptureLogger;

    static LOGGER: CaptureLogger = CaptureLogger;
    static INSTALL: Once = Once::new();

    std::thread_local! {
        static LINES: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    impl log::Log for CaptureLogger {
        fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &log::Record<'_>) {
            LINES.with(|lines| lines.borrow_mut().push(format!("{}", record.args())));
        }

        fn flush(&self) {}
    }

    /// Installs the capture logger once and clears this thread's messages.
    pub fn start() {
        INSTALL.call_once(|| {
            let _ = log::set_logger(&LOGGER);
            log::set_max_level(log::LevelFilter::Trace);
        });

        LINES.with(|lines| lines.borrow_mut().clear());
    }

    /// Messages logged on this thread since the last [`start`].
    pub fn lines() -> Vec<String> {
        LINES.with(|lines| lines.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::string::String};

    #[test]
    fn test_format_record() {
        let mut line = String::new();
        format_record(&mut line, 2, log::Level::Warn, &format_args!("unclaimed vector {}", 200)).unwrap();
        assert_eq!(line, "vcpu-2 WARN: unclaimed vector 200\n");
    }
}
