pub mod events;
pub mod interfaces;
pub mod tasks;
pub mod uint;
