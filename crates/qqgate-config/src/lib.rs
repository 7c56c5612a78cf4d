// SPDX-License-Identifier: MIT
mod loader;
mod schema;
mod validate;

pub use loader::load;
pub use schema::*;
pub use validate::{validate, ConfigError};
