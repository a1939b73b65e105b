pub mod domain;
pub mod events;
