//! Serial GPS port.
//!
//! The device is opened non-blocking and every read waits on `poll(2)` for at
//! most the configured timeout, so a wired but silent receiver yields
//! `ErrorKind::TimedOut` instead of stalling the caller. Real ttys get raw mode
//! and the configured line speed; FIFOs and plain files are read as they are.

use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

pub struct SerialPort {
    file: File,
    timeout: Duration,
}

impl SerialPort {
    pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(path)
            .with_context(|| format!("open gps port {}", path))?;
        let fd = file.as_raw_fd();
        // SAFETY: `fd` belongs to `file`, which outlives the call.
        if unsafe { libc::isatty(fd) } == 1 {
            configure_line(fd, baud)
                .with_context(|| format!("configure {} for {} baud", path, baud))?;
        } else {
            log::debug!("{} is not a tty; line settings left untouched", path);
        }
        Ok(Self { file, timeout })
    }
}

impl Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = self.timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: a single valid pollfd for the duration of the call.
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        match ready {
            -1 => Err(io::Error::last_os_error()),
            0 => Err(timed_out()),
            _ => match self.file.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(timed_out()),
                other => other,
            },
        }
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "no data from gps port")
}

fn line_speed(baud: u32) -> Result<libc::speed_t> {
    let speed = match baud {
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        other => return Err(anyhow!("unsupported gps baud rate {}", other)),
    };
    Ok(speed)
}

fn os_error(call: &str) -> anyhow::Error {
    anyhow::Error::new(io::Error::last_os_error()).context(call.to_string())
}

fn configure_line(fd: libc::c_int, baud: u32) -> Result<()> {
    let speed = line_speed(baud)?;
    // SAFETY: termios is plain data and tcgetattr fills it before it is read.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: `fd` is an open tty and `tio` is a valid termios for every call.
    unsafe {
        if libc::tcgetattr(fd, &mut tio) != 0 {
            return Err(os_error("tcgetattr"));
        }
        libc::cfmakeraw(&mut tio);
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        if libc::cfsetispeed(&mut tio, speed) != 0 || libc::cfsetospeed(&mut tio, speed) != 0 {
            return Err(os_error("cfsetspeed"));
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            return Err(os_error("tcsetattr"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_gps_rates_are_supported() {
        assert_eq!(line_speed(9600).unwrap(), libc::B9600);
        assert_eq!(line_speed(115200).unwrap(), libc::B115200);
        assert!(line_speed(12345).is_err());
    }

    #[test]
    fn missing_device_is_an_error() {
        let err = SerialPort::open("/nonexistent/ttyGPS", 9600, Duration::from_millis(10))
            .err()
            .expect("open must fail");
        assert!(err.to_string().contains("/nonexistent/ttyGPS"));
    }
}
