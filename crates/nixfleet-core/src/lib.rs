//! nixfleet-core — types shared by every nixfleet crate.
//!
//! - **`keys`**: Nix-format ed25519 signing keys, narinfo signatures, and
//!   the public-key-derived [`NodeIdentity`]
//! - **`narinfo`**: narinfo document parsing, canonical rendering, fingerprints
//! - **`cache_info`**: the `/nix-cache-info` document
//! - **`config`**: `nixfleet.toml` configuration file

pub mod cache_info;
pub mod config;
pub mod error;
pub mod keys;
pub mod narinfo;

pub use cache_info::CacheInfo;
pub use config::FleetConfig;
pub use error::{CoreError, CoreResult};
pub use keys::{NarSignature, NodeIdentity, PublicKey, SecretKey};
pub use narinfo::NarInfo;
