#[macro_use]
extern crate log;

#[cfg(feature = "serde")]
#[macro_use]
extern crate serde;

mod config;
mod error;
mod group;

pub use config::GroupConfig;
pub use error::{Error, Result};
pub use group::Group;
