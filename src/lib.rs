pub mod ambient;
pub mod codec;
pub mod error;
pub mod facade;
pub mod guard;
pub mod install;
pub mod lock;
pub mod process;
pub mod store;
pub mod tmux;

pub use ambient::{Ambient, ServerId};
pub use codec::DeviceCodec;
pub use error::{Error, Result};
pub use facade::{DeviceRequest, Socklink, StoreSnapshot, UpdateOutcome};
pub use process::{ProcessTable, SystemProcessTable};
pub use store::{PublishOutcome, Store, StoreLayout, SuppressReason};
pub use tmux::{ActiveClient, TmuxClient};
