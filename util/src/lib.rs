#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![warn(clippy::cast_sign_loss)]

mod from64;
mod maybe_fail;
mod tunable;

pub use from64::From64;
pub use maybe_fail::maybe_fail_with;
pub use maybe_fail::FailInjector;
pub use tunable::get_tunable;
pub use tunable::read_tunable_config;
