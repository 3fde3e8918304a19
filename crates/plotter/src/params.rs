//! Plot inputs and the summary record returned for a finished plot.

use std::fmt;
use std::path::PathBuf;

use crate::error::{PlotError, Result};

/// Smallest supported size parameter.
pub const MIN_K: u8 = 12;

/// Largest supported size parameter.
pub const MAX_K: u8 = 32;

const PLOT_ID_CONTEXT: &str = "plotter 2024-01-01 plot id v1";

/// Key pair a plot is bound to.
///
/// Only the public key and the derived plot id are ever written to disk; the
/// secret key is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct PlotKeys {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl PlotKeys {
    pub fn new(secret_key: [u8; 32], public_key: [u8; 32]) -> Self {
        Self {
            secret_key,
            public_key,
        }
    }

    /// Seed for every hash in the plot: a BLAKE3 key derivation over the
    /// public key and a hash of the secret key.
    pub fn plot_id(&self) -> [u8; 32] {
        let mut material = [0u8; 64];
        material[..32].copy_from_slice(&self.public_key);
        material[32..].copy_from_slice(blake3::hash(&self.secret_key).as_bytes());
        blake3::derive_key(PLOT_ID_CONTEXT, &material)
    }
}

impl fmt::Debug for PlotKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let public: String = self.public_key.iter().map(|b| format!("{b:02x}")).collect();
        f.debug_struct("PlotKeys")
            .field("secret_key", &"<redacted>")
            .field("public_key", &public)
            .finish()
    }
}

/// What to plot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlotParams {
    /// Table 1 holds exactly `2^k` entries.
    pub k: u8,
    pub keys: PlotKeys,
    /// File stem of the output; the plot is written to `<plot_name>.plot`.
    pub plot_name: String,
}

impl PlotParams {
    pub fn new(k: u8, keys: PlotKeys, plot_name: impl Into<String>) -> Self {
        Self {
            k,
            keys,
            plot_name: plot_name.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_k(self.k)?;
        let name = &self.plot_name;
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(PlotError::InvalidConfig(format!(
                "plot name {name:?} is not a plain file name"
            )));
        }
        Ok(())
    }

    pub fn plot_id(&self) -> [u8; 32] {
        self.keys.plot_id()
    }

    pub fn file_name(&self) -> String {
        format!("{}.plot", self.plot_name)
    }
}

pub(crate) fn validate_k(k: u8) -> Result<()> {
    if !(MIN_K..=MAX_K).contains(&k) {
        return Err(PlotError::InvalidK {
            k,
            min: MIN_K,
            max: MAX_K,
        });
    }
    Ok(())
}

/// Summary of a finished plot.
#[derive(Debug, Clone)]
pub struct PlotOutput {
    pub params: PlotParams,
    /// Size of the plot file in bytes.
    pub plot_size: u64,
    pub plot_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(seed: u8) -> PlotKeys {
        PlotKeys::new([seed; 32], [seed.wrapping_add(1); 32])
    }

    #[test]
    fn plot_id_depends_on_both_keys() {
        let a = keys(1).plot_id();
        assert_eq!(a, keys(1).plot_id());

        let mut other_secret = keys(1);
        other_secret.secret_key[0] ^= 1;
        assert_ne!(a, other_secret.plot_id());

        let mut other_public = keys(1);
        other_public.public_key[31] ^= 1;
        assert_ne!(a, other_public.plot_id());
    }

    #[test]
    fn debug_hides_secret() {
        let printed = format!("{:?}", PlotParams::new(18, keys(0xAB), "p"));
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains(&"ab".repeat(32)));
        assert!(printed.contains(&"ac".repeat(32)));
    }

    #[test]
    fn k_bounds() {
        for k in [0, 11, 33, 255] {
            assert!(matches!(
                PlotParams::new(k, keys(1), "p").validate(),
                Err(PlotError::InvalidK { .. })
            ));
        }
        for k in [MIN_K, 20, MAX_K] {
            PlotParams::new(k, keys(1), "p").validate().unwrap();
        }
    }

    #[test]
    fn plot_name_must_be_plain() {
        for name in ["", "a/b", "..", "c\\d"] {
            assert!(PlotParams::new(16, keys(1), name).validate().is_err());
        }
        let params = PlotParams::new(16, keys(1), "farm-01");
        assert_eq!(params.file_name(), "farm-01.plot");
    }
}
