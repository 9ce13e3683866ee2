pub mod codec;
pub mod commander;
pub mod config;
pub mod lieutenant;
pub mod net;
pub mod roster;

pub use anyhow::{anyhow as err, bail, Error, Result};

pub use crate::codec::{Message, Order, ProcessId};
pub use crate::commander::Commander;
pub use crate::config::Config;
pub use crate::lieutenant::Lieutenant;
pub use crate::roster::Roster;
