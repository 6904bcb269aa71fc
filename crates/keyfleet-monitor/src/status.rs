//! Worker status line parsing.
//!
//! Workers maintain a single-line status file of the form
//! `cursor=<hex> rate=<f64> found=<0|1>`. The monitor reads it with a
//! `cat` over the transport; anything that does not parse counts as a
//! missed poll, never as a crash.

/// A successfully parsed worker status report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerStatus {
    /// Next key the worker will scan, absolute within the keyspace.
    pub cursor: u128,
    /// Recent scan rate in keys per second.
    pub rate: f64,
    pub found: bool,
}

/// Parse one status line. Unknown fields are ignored; all three known
/// fields must be present and well formed.
pub fn parse_status_line(line: &str) -> Option<WorkerStatus> {
    let mut cursor = None;
    let mut rate = None;
    let mut found = None;

    for field in line.split_whitespace() {
        let (key, value) = field.split_once('=')?;
        match key {
            "cursor" => {
                let digits = value.strip_prefix("0x").unwrap_or(value);
                cursor = Some(u128::from_str_radix(digits, 16).ok()?);
            }
            "rate" => rate = Some(value.parse::<f64>().ok()?),
            "found" => {
                found = Some(match value {
                    "0" => false,
                    "1" => true,
                    _ => return None,
                });
            }
            _ => {}
        }
    }

    Some(WorkerStatus {
        cursor: cursor?,
        rate: rate?,
        found: found?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_status_line() {
        let status = parse_status_line("cursor=2000000000000f00 rate=1250000.5 found=0").unwrap();
        assert_eq!(status.cursor, 0x2000000000000f00);
        assert_eq!(status.rate, 1_250_000.5);
        assert!(!status.found);
    }

    #[test]
    fn parses_hex_prefix_and_found() {
        let status = parse_status_line("cursor=0xff rate=10 found=1").unwrap();
        assert_eq!(status.cursor, 0xff);
        assert!(status.found);
    }

    #[test]
    fn ignores_unknown_fields() {
        let status = parse_status_line("cursor=10 pid=4242 rate=1.0 found=0").unwrap();
        assert_eq!(status.cursor, 0x10);
    }

    #[test]
    fn rejects_missing_or_malformed_fields() {
        assert!(parse_status_line("").is_none());
        assert!(parse_status_line("cursor=10 rate=1.0").is_none());
        assert!(parse_status_line("cursor=zz rate=1.0 found=0").is_none());
        assert!(parse_status_line("cursor=10 rate=fast found=0").is_none());
        assert!(parse_status_line("cursor=10 rate=1.0 found=maybe").is_none());
        assert!(parse_status_line("cat: worker.status: No such file").is_none());
    }
}
