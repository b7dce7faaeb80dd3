//! Command-line surface of the load tester.

use std::path::PathBuf;

use clap::Parser;

const DEFAULT_MAX_ITERATIONS: u64 = 9_999_999;
const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Decoded hexadecimal key identifier. A newtype so clap treats the whole
/// value as one argument rather than a list of bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyId(pub Vec<u8>);

/// Drives every token-holding slot through a repeated
/// login/find/encrypt/digest/sign/verify/decrypt cycle and journals each
/// step per token identity.
#[derive(Parser, Debug)]
#[command(name = "tokendrill", version)]
pub struct Options {
    /// Path to the PKCS#11 library to load
    #[arg(short = 'l', long = "library")]
    pub library: PathBuf,

    /// USER PIN for the PKCS#11 login
    #[arg(short = 'p', long = "pin")]
    pub pin: String,

    /// Hexadecimal identifier of the certificate and key pair to exercise
    #[arg(short = 'k', long = "key-id", value_parser = parse_key_id)]
    pub key_id: KeyId,

    /// Maximum iteration count
    #[arg(short = 'c', long = "count", default_value_t = DEFAULT_MAX_ITERATIONS)]
    pub count: u64,

    /// Interval between iterations, in milliseconds
    #[arg(short = 'i', long = "interval", default_value_t = DEFAULT_INTERVAL_MS)]
    pub interval: u64,

    /// Enable debug output
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,
}

fn parse_key_id(value: &str) -> Result<KeyId, String> {
    if value.is_empty() {
        return Err("the key identifier must not be empty".to_string());
    }
    hex::decode(value)
        .map(KeyId)
        .map_err(|e| format!("invalid hexadecimal key identifier: {e}"))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Options;

    #[test]
    fn parses_a_full_invocation() {
        let options = Options::parse_from([
            "tokendrill",
            "-l",
            "/usr/lib/softhsm/libsofthsm2.so",
            "-p",
            "1234",
            "-k",
            "01",
            "-c",
            "3",
            "-i",
            "250",
            "-d",
        ]);
        assert_eq!(options.pin, "1234");
        assert_eq!(options.key_id.0, vec![0x01]);
        assert_eq!(options.count, 3);
        assert_eq!(options.interval, 250);
        assert!(options.debug);
    }

    #[test]
    fn defaults_apply_when_omitted() {
        let options =
            Options::parse_from(["tokendrill", "-l", "/lib/p11.so", "-p", "1234", "-k", "0A0B"]);
        assert_eq!(options.key_id.0, vec![0x0A, 0x0B]);
        assert_eq!(options.count, 9_999_999);
        assert_eq!(options.interval, 1000);
        assert!(!options.debug);
    }

    #[test]
    fn missing_mandatory_arguments_are_rejected() {
        assert!(Options::try_parse_from(["tokendrill", "-p", "1234", "-k", "01"]).is_err());
        assert!(Options::try_parse_from(["tokendrill", "-l", "/lib/p11.so", "-k", "01"]).is_err());
        assert!(
            Options::try_parse_from(["tokendrill", "-l", "/lib/p11.so", "-p", "1234"]).is_err()
        );
    }

    #[test]
    fn key_id_must_be_valid_hex() {
        assert!(
            Options::try_parse_from(["tokendrill", "-l", "/l.so", "-p", "1", "-k", "xyz"])
                .is_err()
        );
        assert!(
            Options::try_parse_from(["tokendrill", "-l", "/l.so", "-p", "1", "-k", "012"])
                .is_err()
        );
        assert!(
            Options::try_parse_from(["tokendrill", "-l", "/l.so", "-p", "1", "-k", ""]).is_err()
        );
    }
}
