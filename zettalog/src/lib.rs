#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![warn(clippy::cast_sign_loss)]

pub mod base_types;
pub mod chain;
mod claim;
mod itx;
mod lwb;
pub mod records;
mod replay;
pub mod spa;
mod writer;
mod zilog;

pub use crate::claim::check_log_chain;
pub use crate::claim::claim;
pub use crate::itx::Itx;
pub use crate::itx::ItxPrivate;
pub use crate::lwb::CommitWaiter;
pub use crate::lwb::Lwb;
pub use crate::lwb::LwbState;
pub use crate::replay::NullGetData;
pub use crate::zilog::LogBias;
pub use crate::zilog::SyncPolicy;
pub use crate::zilog::Zilog;
