pub mod access_key;
pub mod error;
pub mod models;
pub mod money;
pub mod parsing;
pub mod state;
pub mod tax;
pub mod validation;
