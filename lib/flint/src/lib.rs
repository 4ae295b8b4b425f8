#![allow(clippy::new_without_default)]

pub mod encoding;
pub mod logging;
pub mod time;
