pub mod change_event;

pub use change_event::{ChangeEvent, Operation, Row};
