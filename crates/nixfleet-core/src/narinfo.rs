//! Narinfo documents — the metadata Nix fetches for one store path.
//!
//! A narinfo is a list of `Key: value` lines. Parsing keeps unknown keys
//! out of the model; rendering always emits fields in the canonical order
//! used by Nix itself, so a parse/render cycle normalizes the document.

use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::keys::NarSignature;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarInfo {
    pub store_path: String,
    pub url: String,
    pub compression: Option<String>,
    pub file_hash: Option<String>,
    pub file_size: Option<u64>,
    pub nar_hash: String,
    pub nar_size: u64,
    /// Base names of referenced store paths.
    pub references: Vec<String>,
    pub deriver: Option<String>,
    pub system: Option<String>,
    pub signatures: Vec<NarSignature>,
    pub ca: Option<String>,
}

impl NarInfo {
    pub fn parse(input: &str) -> CoreResult<Self> {
        let mut store_path = None;
        let mut url = None;
        let mut compression = None;
        let mut file_hash = None;
        let mut file_size = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = Vec::new();
        let mut deriver = None;
        let mut system = None;
        let mut signatures = Vec::new();
        let mut ca = None;

        for (index, line) in input.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                CoreError::NarInfo(format!("line {}: expected 'Key: value'", index + 1))
            })?;
            let value = value.trim();

            match key {
                "StorePath" => store_path = Some(value.to_string()),
                "URL" => url = Some(value.to_string()),
                "Compression" => compression = Some(value.to_string()),
                "FileHash" => file_hash = Some(value.to_string()),
                "FileSize" => file_size = Some(parse_size(key, value)?),
                "NarHash" => nar_hash = Some(value.to_string()),
                "NarSize" => nar_size = Some(parse_size(key, value)?),
                "References" => {
                    references = value.split_whitespace().map(str::to_string).collect();
                }
                "Deriver" => deriver = Some(value.to_string()),
                "System" => system = Some(value.to_string()),
                "Sig" => signatures.push(NarSignature::parse(value)?),
                "CA" => ca = Some(value.to_string()),
                _ => {}
            }
        }

        let store_path = store_path.ok_or_else(|| missing("StorePath"))?;
        if !store_path.starts_with('/') || !store_path.contains('-') {
            return Err(CoreError::NarInfo(format!("invalid StorePath '{store_path}'")));
        }

        Ok(Self {
            store_path,
            url: url.ok_or_else(|| missing("URL"))?,
            compression,
            file_hash,
            file_size,
            nar_hash: nar_hash.ok_or_else(|| missing("NarHash"))?,
            nar_size: nar_size.ok_or_else(|| missing("NarSize"))?,
            references,
            deriver,
            system,
            signatures,
            ca,
        })
    }

    /// Directory holding the store path, e.g. `/nix/store`.
    pub fn store_dir(&self) -> &str {
        self.store_path
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or("")
    }

    /// The string that signatures are computed over:
    /// `1;<store path>;<nar hash>;<nar size>;<full reference paths, comma separated>`.
    pub fn fingerprint(&self) -> String {
        let dir = self.store_dir();
        let references = self
            .references
            .iter()
            .map(|r| format!("{dir}/{r}"))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "1;{};{};{};{}",
            self.store_path, self.nar_hash, self.nar_size, references
        )
    }

    pub fn is_signed_by(&self, name: &str) -> bool {
        self.signatures.iter().any(|s| s.name == name)
    }

    /// Append `signature` unless one from the same signer is present.
    /// Returns whether the document changed.
    pub fn add_signature(&mut self, signature: NarSignature) -> bool {
        if self.is_signed_by(&signature.name) {
            return false;
        }
        self.signatures.push(signature);
        true
    }
}

impl fmt::Display for NarInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StorePath: {}", self.store_path)?;
        writeln!(f, "URL: {}", self.url)?;
        if let Some(compression) = &self.compression {
            writeln!(f, "Compression: {compression}")?;
        }
        if let Some(file_hash) = &self.file_hash {
            writeln!(f, "FileHash: {file_hash}")?;
        }
        if let Some(file_size) = self.file_size {
            writeln!(f, "FileSize: {file_size}")?;
        }
        writeln!(f, "NarHash: {}", self.nar_hash)?;
        writeln!(f, "NarSize: {}", self.nar_size)?;
        writeln!(f, "References: {}", self.references.join(" "))?;
        if let Some(deriver) = &self.deriver {
            writeln!(f, "Deriver: {deriver}")?;
        }
        if let Some(system) = &self.system {
            writeln!(f, "System: {system}")?;
        }
        for signature in &self.signatures {
            writeln!(f, "Sig: {signature}")?;
        }
        if let Some(ca) = &self.ca {
            writeln!(f, "CA: {ca}")?;
        }
        Ok(())
    }
}

fn parse_size(key: &str, value: &str) -> CoreResult<u64> {
    value
        .parse()
        .map_err(|_| CoreError::NarInfo(format!("{key}: '{value}' is not a number")))
}

fn missing(key: &str) -> CoreError {
    CoreError::NarInfo(format!("missing required field {key}"))
}
