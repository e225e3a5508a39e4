//! Key material and the binding certificate provider.
//!
//! # Components
//!
//! - [`material`] - Key pairs (RSA, P-256, platform-held) and origin classification
//! - [`store`] - Lookup of persisted machine and user keys
//! - [`provider`] - Key resolution order and self-signed certificate rotation

pub mod material;
pub mod provider;
pub mod store;

pub use material::{KeyAlgorithm, KeyMaterial, KeyOrigin, PlatformKey};
pub use provider::KeyMaterialProvider;
pub use store::{FileKeyStore, KeyScope, KeyStore, NoKeyStore};
