use std::fmt;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub static PR: Pr = Pr {
    writer: Mutex::new(Writer),
    panicked: AtomicBool::new(false),
};

// lock to avoid interleaving concurrent println!'s.
// panicked sits outside the writer lock so a panicking kernel stack
// can still get its message out.
pub struct Pr {
    writer: Mutex<Writer>,
    panicked: AtomicBool,
}

impl Pr {
    pub fn panicked(&self) -> &AtomicBool {
        &self.panicked
    }
}

pub struct Writer;

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        std::io::stdout()
            .write_all(s.as_bytes())
            .map_err(|_| fmt::Error)
    }
}

pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;

    if !PR.panicked.load(Ordering::Relaxed) {
        match PR.writer.lock() {
            Ok(mut w) => w.write_fmt(args).expect("_print: error"),
            Err(mut e) => e.get_mut().write_fmt(args).expect("_print: error"),
        }
    } else {
        // for panic!
        let _ = Writer.write_fmt(args);
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    ($fmt:expr) => {
        print!(concat!($fmt, "\n"))
    };
    ($fmt:expr, $($arg:tt)*) => {
        print!(concat!($fmt, "\n"), $($arg)*)
    };
}
