pub mod identity;
pub mod script;
