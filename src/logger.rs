use log::{Level, Log, Metadata, Record};

static LOGGER: Logger = Logger {};

pub fn setup_logger(max_level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

struct Logger {}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if record.level() <= Level::Warn {
            eprintln!(
                "{} {} -- {}",
                record.level(),
                record.target(),
                record.args()
            );
        } else {
            println!(
                "{} {} -- {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Formats cookies, SPIs and identity payloads as space-separated hex bytes.
pub fn fmt_slice_hex(data: &[u8]) -> impl std::fmt::Display + '_ {
    struct HexSlice<'a>(&'a [u8]);
    impl std::fmt::Display for HexSlice<'_> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            for (i, b) in self.0.iter().enumerate() {
                write!(f, "{b:02x}")?;
                if i + 1 < self.0.len() {
                    write!(f, " ")?;
                }
            }
            Ok(())
        }
    }
    HexSlice(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_slice() {
        assert_eq!(fmt_slice_hex(&[0x0a, 0xff, 0x00]).to_string(), "0a ff 00");
        assert_eq!(fmt_slice_hex(&[]).to_string(), "");
    }
}
