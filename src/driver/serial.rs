//! Minimal 16550 console sink on COM1.
//!
//! Just enough of the UART to carry boot and panic output: polled,
//! blocking writes, no receive path.

use argon_log::ConsoleWrite;

use crate::io::Port8;

const COM1: u16 = 0x3f8;

const TX_READY: u8 = 0x20;

struct Serial {
    base: u16,
}

static COM1_SERIAL: Serial = Serial { base: COM1 };

impl Serial {
    const fn data(&self) -> Port8 {
        Port8::new(self.base)
    }

    const fn int_ena(&self) -> Port8 {
        Port8::new(self.base + 1)
    }

    const fn fifo_control(&self) -> Port8 {
        Port8::new(self.base + 2)
    }

    const fn line_control(&self) -> Port8 {
        Port8::new(self.base + 3)
    }

    const fn modem_control(&self) -> Port8 {
        Port8::new(self.base + 4)
    }

    const fn line_status(&self) -> Port8 {
        Port8::new(self.base + 5)
    }

    fn init(&self) {
        self.int_ena().write(0x00); // Disable all interrupts
        self.line_control().write(0x80); // Enable DLAB (set baud rate divisor)
        self.data().write(0x01); // Divisor 1 (lo byte): 115200 baud
        self.int_ena().write(0x00); //           (hi byte)
        self.line_control().write(0x03); // 8 bits, no parity, one stop bit
        self.fifo_control().write(0xc7); // Enable and clear FIFOs, 14-byte threshold
        self.modem_control().write(0x0b); // DTR/RTS set, OUT2 enabled
    }

    fn putc(&self, byte: u8) {
        while self.line_status().read() & TX_READY == 0 {}
        self.data().write(byte);
    }
}

impl ConsoleWrite for Serial {
    fn write(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.putc(b'\r');
            }
            self.putc(byte);
        }
    }
}

/// Bring up COM1 and register it as the kernel console.
pub fn setup() {
    COM1_SERIAL.init();
    argon_log::set_console(&COM1_SERIAL);
}
