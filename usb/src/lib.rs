pub use rusb;
pub mod devices;
pub mod error;
pub mod events;
pub mod register;
pub mod session;
pub mod stream;

mod device;
