//! Equipment workers

pub mod fleet;
pub mod replay;
pub mod worker;

pub use fleet::Fleet;
pub use replay::replay_file;
pub use worker::EquipmentMonitor;
