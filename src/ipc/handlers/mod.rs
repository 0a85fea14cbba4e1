pub mod core;
pub mod grid;
pub mod roster;
pub mod scores;
pub mod templates;
