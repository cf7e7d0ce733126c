pub use std::str::FromStr;
pub use std::time::Duration;

pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};

pub use crate::config::{self, Config};
pub use crate::database::Database;
pub use crate::options::Options;
