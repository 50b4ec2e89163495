pub mod clock;
pub mod identifiers;
pub mod polling;
