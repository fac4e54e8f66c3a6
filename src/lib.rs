//! # sbx — Firecracker-backed sandbox lifecycle manager
//!
//! Facade crate that re-exports the sbx workspace crates so consumers can
//! depend on a single `sbx` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | sbx-core | Types, identifiers, status machine, error kinds |
//! | [`storage`] | sbx-storage | SQLite repository, task ledger, image catalog |
//! | [`engine`] | sbx-engine | Engine contract, Firecracker and fake backends |
//! | [`client`] | sbx-client | Lifecycle services and the `Client` facade |
//!
//! The typical entry point is [`client::Client`]:
//!
//! ```no_run
//! use sbx::client::{Client, ClientConfig, CreateOptions, StartOptions};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let client = Client::open(ClientConfig::default())?;
//! let sandbox = client.create(CreateOptions::default()).await?;
//! client.start(&sandbox.name, StartOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub use sbx_client as client;
pub use sbx_core as core;
pub use sbx_engine as engine;
pub use sbx_storage as storage;
