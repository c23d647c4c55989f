//! Ring-buffer logging for a `no_std` environment.
//!
//! Log lines land in a fixed 64 KiB buffer that overwrites old data when
//! full; an external debugger or the platform UART bridge can drain it
//! without core involvement. The `log!` macro accepts standard `format!`
//! syntax.

use core::fmt::{self, Write};

use spin::Mutex;

const LOG_BUF_SIZE: usize = 64 * 1024;

struct LogBuffer {
    buf: [u8; LOG_BUF_SIZE],
    pos: usize,
    wrapped: bool,
}

static LOG: Mutex<LogBuffer> = Mutex::new(LogBuffer {
    buf: [0; LOG_BUF_SIZE],
    pos: 0,
    wrapped: false,
});

impl LogBuffer {
    fn push(&mut self, b: u8) {
        self.buf[self.pos] = b;
        self.pos += 1;
        if self.pos == LOG_BUF_SIZE {
            self.pos = 0;
            self.wrapped = true;
        }
    }
}

/// Writer handed out by the `log!` macro.
pub struct LogWriter;

impl Write for LogWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut log = LOG.lock();
        for &b in s.as_bytes() {
            log.push(b);
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        use core::fmt::Write as _;
        let _ = core::fmt::write(&mut $crate::log::LogWriter, format_args!($($arg)*));
        let _ = $crate::log::LogWriter.write_str("\r\n");
    }};
}

/// Copy the most recent log bytes into `out`, oldest first. Returns the
/// number of bytes written.
pub fn snapshot(out: &mut [u8]) -> usize {
    let log = LOG.lock();
    let (first, second) = if log.wrapped {
        (&log.buf[log.pos..], &log.buf[..log.pos])
    } else {
        (&log.buf[..log.pos], &log.buf[..0])
    };
    let total = first.len() + second.len();
    let skip = total.saturating_sub(out.len());
    let mut n = 0;
    for &b in first.iter().chain(second.iter()).skip(skip) {
        if n == out.len() {
            break;
        }
        out[n] = b;
        n += 1;
    }
    n
}
