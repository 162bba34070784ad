use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt::time::UtcTime, EnvFilter};

static LOGGING: OnceCell<()> = OnceCell::new();

/// Installs the fmt subscriber for native hosts. `RUST_LOG` picks the level, `info` otherwise.
/// Calling it again is a no-op.
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let result = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .try_init();
        if let Err(err) = result {
            eprintln!("logging already initialised: {}", err);
        }
    });
}

/// Renders `buffer` as 16-byte rows labelled from `base`.
pub fn hexdump(buffer: &[u8], base: i64) -> String {
    let mut str = String::new();
    for (row, chunk) in buffer.chunks(16).enumerate() {
        let addr = base + (row * 16) as i64;
        let mut line = if addr < 0 {
            format!("-{:07x}: ", addr.unsigned_abs())
        } else {
            format!("{:08x}: ", addr)
        };
        let mut chars = String::new();
        for &byte in chunk {
            line.push_str(&format!("{:02x} ", byte));
            let c = byte as char;
            chars.push(if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                '.'
            });
        }

        str.push_str(&format!("{:<58} {}\n", line, chars));
    }

    str
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexdump() {
        let dump = hexdump(b"Hello, world!\x00\x01\x02\x03\x04", 0x10);
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000010: 48 65 6c 6c 6f"));
        assert!(lines[0].ends_with("Hello, world!..."));
        assert!(lines[1].starts_with("00000020: 03 04"));
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
