pub mod checkpoint;
pub mod manager;
pub mod state_machine;
pub mod swap;
