#![allow(
    non_camel_case_types,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

pub mod channel;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod fifo;
pub mod interleave;
pub mod page;
pub mod policy;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod sim;
pub mod traffic;

pub mod testing;

pub use channel::{AdmissionRejected, Retry};
pub use config::{Config, ConfigError};
pub use dispatch::ResponseError;
pub use request::{Kind, Request, RequestId, Response, Token};
pub use scheduler::{Scheduler, Topology};

pub type address = u64;
