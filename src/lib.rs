//! App registry and setup lifecycle manager.
//!
//! Apps are compiled-in descriptors implementing [`App`]. The host registers
//! the enabled ones, orders them by their declared dependencies, runs each
//! app's `setup` when its declared version is ahead of the persisted one, and
//! then calls `init`. A failing app is marked broken without stopping the
//! others.
//!
//! # Example
//!
//! ```rust,no_run
//! use lib_app_host::{App, AppCatalog, AppHost, AppInfo, HostConfig};
//!
//! struct Deluge;
//!
//! impl App for Deluge {
//!     fn info(&self) -> AppInfo {
//!         AppInfo::new(2)
//!             .depends_on("apps")
//!             .with_packages(["deluged", "deluge-web"])
//!     }
//! }
//!
//! struct Apps;
//!
//! impl App for Apps {
//!     fn info(&self) -> AppInfo {
//!         AppInfo::new(1).essential(true)
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = AppCatalog::new()
//!         .with("apps", || Apps)
//!         .with("deluge", || Deluge);
//!
//!     let mut host = AppHost::new(HostConfig::default())?;
//!     host.scan_enabled(&catalog)?;
//!
//!     let (manager, report) = host.start()?;
//!     for (app, failure) in report.failed() {
//!         eprintln!("{app}: {failure}");
//!     }
//!
//!     manager.enable("deluge")?;
//!     Ok(())
//! }
//! ```

mod app;
mod callbacks;
mod catalog;
mod config;
mod error;
mod host;
mod lifecycle;
mod registry;
mod resolver;
mod setup;
mod state;

pub use app::*;
pub use callbacks::*;
pub use catalog::*;
pub use config::*;
pub use error::*;
pub use host::*;
pub use lifecycle::*;
pub use registry::*;
pub use resolver::*;
pub use setup::*;
pub use state::*;
