use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use rand::{Rng, RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

pub type RngGen = Pcg64Mcg;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Creates the random source of a run. A zero seed means "seed from entropy".
pub fn new_rng(seed: u64) -> RngGen {
    if seed == 0 {
        RngGen::new(rand::thread_rng().gen())
    } else {
        RngGen::seed_from_u64(seed)
    }
}

/// The kind of filler value written to synthetic columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    /// Little-endian bytes of a uniform f64 in [0, 1).
    Float,

    /// A string of N lowercase hex digits.
    Hex(usize),
}

impl PayloadKind {
    pub fn generate(&self, rng: &mut impl RngCore) -> Vec<u8> {
        match *self {
            PayloadKind::Float => rng.gen::<f64>().to_le_bytes().to_vec(),
            PayloadKind::Hex(len) => (0..len)
                .map(|_| HEX_DIGITS[rng.gen_range(0..HEX_DIGITS.len())])
                .collect(),
        }
    }
}

impl FromStr for PayloadKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "float" {
            return Ok(PayloadKind::Float);
        }
        let Some(len) = s.strip_prefix("hex:") else {
            anyhow::bail!("unknown payload kind: {} (expected float or hex:N)", s);
        };
        let len: usize = len
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid hex payload length: {}", len))?;
        anyhow::ensure!(len > 0, "hex payload length must be positive");
        Ok(PayloadKind::Hex(len))
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Float => write!(f, "float"),
            PayloadKind::Hex(len) => write!(f, "hex:{}", len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_kind() {
        assert_eq!("float".parse::<PayloadKind>().unwrap(), PayloadKind::Float);
        assert_eq!("hex:8".parse::<PayloadKind>().unwrap(), PayloadKind::Hex(8));
        assert_eq!(PayloadKind::Hex(16).to_string(), "hex:16");
        assert_eq!(PayloadKind::Float.to_string(), "float");

        for bad in ["", "hex", "hex:", "hex:0", "hex:-1", "double"] {
            assert!(bad.parse::<PayloadKind>().is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_float_payload() {
        let mut rng = new_rng(1);
        for _ in 0..100 {
            let bytes = PayloadKind::Float.generate(&mut rng);
            let value = f64::from_le_bytes(bytes.try_into().unwrap());
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn test_hex_payload() {
        let mut rng = new_rng(1);
        let bytes = PayloadKind::Hex(32).generate(&mut rng);
        assert_eq!(bytes.len(), 32);
        assert!(bytes.iter().all(|b| HEX_DIGITS.contains(b)));
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let a = PayloadKind::Hex(16).generate(&mut new_rng(5));
        let b = PayloadKind::Hex(16).generate(&mut new_rng(5));
        let c = PayloadKind::Hex(16).generate(&mut new_rng(6));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
