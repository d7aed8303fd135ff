//! CLI command implementations.
//!
//! | Module         | Commands handled                                      |
//! |----------------|-------------------------------------------------------|
//! | `registration` | `Register`, `Unregister`, `Enable`, `Disable`, `List` |
//! | `start`        | `Start`                                               |
//! | `config`       | `Config`                                              |
//! | `env`          | `Env`                                                 |
//! | `spawn`        | `Spawn`                                               |

pub mod config;
pub mod env;
pub mod registration;
pub mod spawn;
pub mod start;

pub use config::cmd_config;
pub use env::cmd_env;
pub use registration::{cmd_list, cmd_register, cmd_set_enabled, cmd_unregister};
pub use spawn::{SpawnArgs, cmd_spawn};
pub use start::cmd_start;
